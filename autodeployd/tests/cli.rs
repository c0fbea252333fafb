use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

const CONFIG: &str = r#"
[daemon]
socket = "/tmp/autodeployd-cli-test.sock"

[repos."acme/site"]
secret = "s3cr3t"
local = "/srv/site"
branch = "main"

[repos."acme/docs"]
secret = "d0cs"
local = "/srv/docs.git"
bare = true
"#;

fn write_config(mode: u32) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    fs::set_permissions(file.path(), fs::Permissions::from_mode(mode)).unwrap();
    file
}

#[test]
fn test_help_describes_daemon() {
    let output = Command::new(env!("CARGO_BIN_EXE_autodeployd"))
        .arg("--help")
        .output()
        .expect("Failed to run autodeployd --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("autodeploy daemon"));
    assert!(stdout.contains("--check-config"));
}

#[test]
fn test_check_config_lists_repositories() {
    let config = write_config(0o600);

    let output = Command::new(env!("CARGO_BIN_EXE_autodeployd"))
        .arg("--config")
        .arg(config.path())
        .arg("--check-config")
        .output()
        .expect("Failed to run autodeployd --check-config");

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("OK, 2 repositories"));
    assert!(stdout.contains("acme/site -> /srv/site (checkout)"));
    assert!(stdout.contains("acme/docs -> /srv/docs.git (bare)"));
    assert!(!stdout.contains("s3cr3t"));
}

#[test]
fn test_config_from_environment() {
    let config = write_config(0o640);

    let output = Command::new(env!("CARGO_BIN_EXE_autodeployd"))
        .env("AUTODEPLOY_CONFIG", config.path())
        .arg("--check-config")
        .output()
        .expect("Failed to run autodeployd");

    assert!(output.status.success(), "{output:?}");
}

#[test]
fn test_world_readable_config_is_refused() {
    let config = write_config(0o644);

    let output = Command::new(env!("CARGO_BIN_EXE_autodeployd"))
        .arg("--config")
        .arg(config.path())
        .arg("--check-config")
        .output()
        .expect("Failed to run autodeployd");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("readable or writable by other users"), "{stderr}");
}
