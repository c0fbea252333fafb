//! CGI front end: one delivery per process.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::receiver::{Outcome, Receiver, SIGNATURE_HEADERS};

/// Largest body accepted on stdin.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The parts of the CGI environment a delivery needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiRequest {
    pub method: String,
    pub content_length: usize,
    pub signature: Option<String>,
}

impl CgiRequest {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let signature = SIGNATURE_HEADERS.iter().find_map(|header| {
            var(&cgi_variable(header))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        });
        Self {
            method: var("REQUEST_METHOD").unwrap_or_default(),
            content_length: var("CONTENT_LENGTH")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            signature,
        }
    }
}

/// `x-gitea-signature` -> `HTTP_X_GITEA_SIGNATURE`.
fn cgi_variable(header: &str) -> String {
    format!("HTTP_{}", header.to_ascii_uppercase().replace('-', "_"))
}

/// Read exactly `content_length` bytes of body.
pub async fn read_body<R>(input: R, content_length: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::with_capacity(content_length);
    input
        .take(content_length as u64)
        .read_to_end(&mut body)
        .await?;
    Ok(body)
}

/// CGI response text: `Status:` and `Content-Type:` headers, blank line, body.
pub fn render(outcome: &Outcome) -> String {
    format!(
        "Status: {} {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        outcome.status.as_u16(),
        outcome.status.canonical_reason().unwrap_or(""),
        outcome.body
    )
}

/// Process the delivery described by `request`, reading its body from `input`.
pub async fn respond<R>(receiver: &Receiver, request: &CgiRequest, input: R) -> Result<Outcome>
where
    R: AsyncRead + Unpin,
{
    if !request.method.eq_ignore_ascii_case("POST") {
        return Ok(Outcome::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Only POST is supported",
        ));
    }
    if request.content_length > MAX_BODY_BYTES {
        return Ok(Outcome::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Payload too large",
        ));
    }

    let body = read_body(input, request.content_length)
        .await
        .context("Failed to read request body")?;
    Ok(receiver.handle(&body, request.signature.as_deref()).await)
}

/// Entry point for `autodeploy cgi`.
pub async fn run(receiver: &Receiver) -> Result<()> {
    let request = CgiRequest::from_env();
    let outcome = respond(receiver, &request, tokio::io::stdin()).await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(render(&outcome).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
