//! Integration tests for the midi-request-trigger binary
//!
//! - HTTP surface comes up on the configured port
//! - Trigger URIs answer 500 while the MIDI device is missing
//! - Malformed configuration falls back to defaults
//! - File log outputs receive the service log

use miditrig_test_utils::find_available_port;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Verify a port is listening
async fn wait_for_port(port: u16, max_wait: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < max_wait {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "miditrig-{}-{}.toml",
        name,
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

fn spawn(args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_midi-request-trigger"))
        .args(args)
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("service should spawn")
}

#[tokio::test]
async fn test_serves_trigger_uris() {
    let port = find_available_port().await;
    let config = write_config(
        "serve",
        r#"
[http]
bind_addr = "127.0.0.1"
debug = false

[[midi_routers]]
name = "Absent"
device = "^No Such Device On This Host$"
disable_listener = true

[[midi_routers.request_triggers]]
uri = "/go"
note = 60
velocity = 100
"#,
    );

    let mut child = spawn(&[
        "--config",
        config.to_str().unwrap(),
        "--http-port",
        &port.to_string(),
    ]);
    assert!(
        wait_for_port(port, Duration::from_secs(10)).await,
        "service should listen on {}",
        port
    );

    let root = reqwest::get(format!("http://127.0.0.1:{}/", port))
        .await
        .unwrap();
    assert_eq!(root.status().as_u16(), 200);
    assert_eq!(
        root.text().await.unwrap(),
        "MIDI Request Trigger is available\n"
    );

    // The device never shows up, so the output port stays unbound
    let go = reqwest::get(format!("http://127.0.0.1:{}/go", port))
        .await
        .unwrap();
    assert_eq!(go.status().as_u16(), 500);

    let missing = reqwest::get(format!("http://127.0.0.1:{}/other", port))
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    child.kill().await.unwrap();
    let _ = std::fs::remove_file(config);
}

#[tokio::test]
async fn test_malformed_config_exits_cleanly_with_no_routers() {
    let config = write_config("broken", "[[midi_routers]\nname = ");

    let mut child = spawn(&["--config", config.to_str().unwrap()]);
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("service should exit")
        .unwrap();
    assert!(status.success());

    let _ = std::fs::remove_file(config);
}

#[tokio::test]
async fn test_logs_to_configured_file() {
    let log_path = std::env::temp_dir().join(format!("miditrig-file-{}.log", std::process::id()));
    let _ = std::fs::remove_file(&log_path);
    let config = write_config(
        "logfile",
        &format!(
            "[log]\noutputs = [{:?}]\nrotation = \"never\"\n",
            log_path.display().to_string()
        ),
    );

    let mut child = spawn(&["--config", config.to_str().unwrap()]);
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("service should exit")
        .unwrap();
    assert!(status.success());

    let contents = std::fs::read_to_string(&log_path).expect("log file should exist");
    assert!(contents.contains("No midi routers configured"), "{}", contents);

    let _ = std::fs::remove_file(log_path);
    let _ = std::fs::remove_file(config);
}

#[tokio::test]
async fn test_version_flag() {
    let output = Command::new(env!("CARGO_BIN_EXE_midi-request-trigger"))
        .arg("--version")
        .output()
        .await
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}
