//! Unix socket server.

use autodeploy_common::SyncResponse;
use autodeploy_common::transport::{TransportError, read_request, write_response};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::notify::Notifier;
use crate::runner::CommandRunner;
use crate::sync::{Stage, SyncService};

/// How long a client may take to send its request and half-close.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0} exists and is not a socket")]
    NotASocket(PathBuf),

    #[error("another daemon is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to set up socket {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Bind the daemon socket, replacing a stale one.
///
/// A replaced socket's owner, group and mode carry over to the new one so
/// that whatever access the administrator granted stays in place.
pub fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    let io_err = |source: std::io::Error| ServerError::Io {
        path: path.to_path_buf(),
        source,
    };

    let previous = match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(ServerError::NotASocket(path.to_path_buf()));
            }
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(ServerError::AlreadyRunning(path.to_path_buf()));
            }
            debug!("Removing stale socket {}", path.display());
            fs::remove_file(path).map_err(io_err)?;
            Some((meta.uid(), meta.gid(), meta.mode() & 0o7777))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(io_err(e)),
    };

    let listener = UnixListener::bind(path).map_err(io_err)?;
    if let Some((uid, gid, mode)) = previous {
        std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(io_err)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err)?;
    }
    Ok(listener)
}

/// Remove the socket on shutdown, leaving anything that is not a socket alone.
pub fn remove_socket(path: &Path) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove socket {}: {}", path.display(), e);
            }
        }
        _ => {}
    }
}

/// Accept connections until `shutdown` fires, then wait for in-flight ones.
pub async fn serve<R, N>(
    listener: UnixListener,
    service: SyncService<R, N>,
    shutdown: CancellationToken,
) where
    R: CommandRunner,
    N: Notifier,
{
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let service = service.clone();
                    let span = info_span!("request", id = %Uuid::new_v4());
                    tracker.spawn(
                        async move {
                            if let Err(e) = handle_connection(stream, &service).await {
                                warn!("Connection error: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }
    }

    tracker.close();
    if !tracker.is_empty() {
        info!("Waiting for {} in-flight request(s)", tracker.len());
    }
    tracker.wait().await;
}

/// One request, one response.
pub async fn handle_connection<R, N>(
    stream: UnixStream,
    service: &SyncService<R, N>,
) -> Result<(), TransportError>
where
    R: CommandRunner,
    N: Notifier,
{
    let (reader, mut writer) = stream.into_split();

    let response = match read_request(reader, REQUEST_READ_TIMEOUT).await {
        Ok(raw) => service.handle_request(&raw).await,
        Err(err) => {
            warn!(stage = %Stage::AwaitRequest, "Could not read request: {}", err);
            SyncResponse::Error(err.to_string())
        }
    };

    debug!(stage = %Stage::Respond, ok = response.is_ok(), "Writing response");
    write_response(&mut writer, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::recording::RecordingNotifier;
    use crate::testing::FakeGit;
    use autodeploy_common::{Config, Message, SharedConfig, send_message};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bind_creates_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodeploy.sock");

        let _listener = bind_socket(&path).unwrap();

        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_socket());
    }

    #[tokio::test]
    async fn test_stale_socket_permissions_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodeploy.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o660)).unwrap();
        let before = fs::metadata(&path).unwrap();

        let _listener = bind_socket(&path).unwrap();

        let after = fs::symlink_metadata(&path).unwrap();
        assert!(after.file_type().is_socket());
        assert_eq!(after.mode() & 0o777, 0o660);
        assert_eq!(after.uid(), before.uid());
        assert_eq!(after.gid(), before.gid());
    }

    #[tokio::test]
    async fn test_regular_file_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodeploy.sock");
        fs::write(&path, "not a socket").unwrap();

        let err = bind_socket(&path).unwrap_err();

        assert!(matches!(err, ServerError::NotASocket(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "not a socket");
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodeploy.sock");
        let _running = bind_socket(&path).unwrap();

        let err = bind_socket(&path).unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_remove_socket_ignores_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keep.txt");
        fs::write(&file, "x").unwrap();
        remove_socket(&file);
        assert!(file.exists());

        let path = dir.path().join("autodeploy.sock");
        drop(bind_socket(&path).unwrap());
        remove_socket(&path);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_signed_push_end_to_end_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        fs::create_dir(&site).unwrap();
        let socket = dir.path().join("autodeploy.sock");
        let config = Config::from_toml_str(&format!(
            "[repos.\"acme/site\"]\nsecret = \"s3cr3t\"\nlocal = \"{}\"\nbranch = \"main\"\n",
            site.display()
        ))
        .unwrap();

        let git = Arc::new(FakeGit::new());
        git.set_head(&site, "aaa111");
        let service = SyncService::new(
            SharedConfig::new(config),
            Arc::clone(&git),
            Arc::new(RecordingNotifier::default()),
        );
        let shutdown = CancellationToken::new();
        let listener = bind_socket(&socket).unwrap();
        let server = tokio::spawn(serve(listener, service, shutdown.clone()));

        let payload = Message::new("acme/site", "refs/heads/main", "aaa111", "bbb222")
            .with_pusher("alice", "Alice Example", "alice@example.org")
            .sign(b"s3cr3t")
            .unwrap();
        let reply = send_message(&socket, &payload, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(reply.success, "daemon said: {}", reply.body);
        assert!(reply.body.contains("bbb222"));
        assert_eq!(git.head(&site).as_deref(), Some("bbb222"));

        let tampered = String::from_utf8(payload)
            .unwrap()
            .replace("bbb222", "ccc333");
        let reply = send_message(&socket, tampered.as_bytes(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.body, "ERROR: invalid signature for 'acme/site'");
        assert_eq!(git.head(&site).as_deref(), Some("bbb222"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_sync_finish() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        fs::create_dir(&site).unwrap();
        let socket = dir.path().join("autodeploy.sock");
        let config = Config::from_toml_str(&format!(
            "[repos.\"acme/site\"]\nsecret = \"s3cr3t\"\nlocal = \"{}\"\nbranch = \"main\"\n",
            site.display()
        ))
        .unwrap();

        let git = Arc::new(FakeGit::new().with_delay(Duration::from_millis(100)));
        git.set_head(&site, "aaa111");
        let service = SyncService::new(
            SharedConfig::new(config),
            Arc::clone(&git),
            Arc::new(RecordingNotifier::default()),
        );
        let shutdown = CancellationToken::new();
        let listener = bind_socket(&socket).unwrap();
        let server = tokio::spawn(serve(listener, service, shutdown.clone()));

        let payload = Message::new("acme/site", "refs/heads/main", "aaa111", "bbb222")
            .with_pusher("alice", "Alice Example", "alice@example.org")
            .sign(b"s3cr3t")
            .unwrap();
        let client = {
            let socket = socket.clone();
            tokio::spawn(async move {
                send_message(&socket, &payload, Duration::from_secs(10)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(git.calls_matching("reset").is_empty());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        let reply = client.await.unwrap().unwrap();

        assert!(reply.success, "daemon said: {}", reply.body);
        assert!(reply.body.contains("now: bbb222"));
        assert_eq!(git.head(&site).as_deref(), Some("bbb222"));
    }
}
