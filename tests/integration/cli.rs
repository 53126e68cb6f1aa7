#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::{StubResponse, StubServer, closed_port_url};
use predicates::str::contains;
use tempfile::tempdir;

fn tether() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("tether"))
}

#[test]
fn help_lists_commands() {
    tether()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("start"))
        .stdout(contains("fetch"))
        .stdout(contains("register"))
        .stdout(contains("watch"));
}

#[test]
fn register_posts_to_configured_control_plane() {
    let temp = tempdir().unwrap();
    let server = StubServer::bind().respond(vec![StubResponse::empty(200)]);
    let config_path = temp.path().join("tether.yaml");
    fs::write(
        &config_path,
        format!("control_plane: {}\ndeployment_uri: http://localhost:9085\n", server.url),
    )
    .unwrap();

    tether()
        .args(["register", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stdout(contains("Registered http://localhost:9085"));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].body.contains("http://localhost:9085"));
}

#[test]
fn register_fails_when_control_plane_is_down() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("tether.yaml");
    fs::write(&config_path, format!("control_plane: {}\n", closed_port_url())).unwrap();

    tether()
        .args(["--log-level", "off", "register", "--config"])
        .arg(&config_path)
        .args(["--uri", "http://localhost:9099"])
        .assert()
        .failure()
        .stderr(contains("attempts: 3"));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("tether.yaml");
    fs::write(&config_path, "stop_timeout: eventually\n").unwrap();

    tether()
        .args(["fetch", "--config"])
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(contains("Invalid duration value"));
}

#[cfg(unix)]
#[test]
fn watch_registers_when_workload_is_ready() {
    let temp = tempdir().unwrap();
    let server = StubServer::bind().respond(vec![StubResponse::empty(201)]);
    let config_path = temp.path().join("tether.yaml");
    fs::write(&config_path, format!("control_plane: {}\n", server.url)).unwrap();

    tether()
        .args(["watch", "--config"])
        .arg(&config_path)
        .args([
            "--",
            "sh",
            "-c",
            "echo 'Restate SDK started listening on [::]:9080'; sleep 1",
        ])
        .assert()
        .success();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/deployments");
}

#[cfg(unix)]
#[test]
fn watch_forwards_workload_output_verbatim() {
    let temp = tempdir().unwrap();
    let server = StubServer::bind().respond(vec![StubResponse::empty(200)]);
    let config_path = temp.path().join("tether.yaml");
    fs::write(&config_path, format!("control_plane: {}\n", server.url)).unwrap();

    let output = tether()
        .args(["--log-level", "warn", "watch", "--config"])
        .arg(&config_path)
        .args([
            "--",
            "sh",
            "-c",
            "echo '  hello from workload'; echo 'oops' >&2; \
             echo 'Restate SDK started listening on [::]:9080'; sleep 1",
        ])
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(
        lines,
        [
            "  hello from workload",
            "Restate SDK started listening on [::]:9080"
        ]
    );
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.lines().any(|line| line == "oops"), "stderr: {stderr}");
}
