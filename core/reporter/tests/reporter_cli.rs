use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::process::{Command, Stdio};

use ide_mocha_protocol::{parse_event_line, EventKind};
use tempfile::TempDir;

fn reporter() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ide-mocha-reporter"));
    command.env_remove("IDE_MOCHA_ADDRESS");
    command.env_remove("IDE_MOCHA_REPORTER_LOG");
    command
}

#[test]
fn endpoint_prints_folder_socket() {
    let sockets = TempDir::new().expect("socket dir");
    let output = reporter()
        .arg("endpoint")
        .arg("/work/app")
        .arg("--socket-dir")
        .arg(sockets.path())
        .output()
        .expect("run reporter");

    assert!(output.status.success());
    let printed = String::from_utf8(output.stdout).expect("utf8");
    assert_eq!(
        printed.trim(),
        sockets.path().join("ide-mocha-app.sock").display().to_string()
    );
}

#[test]
fn endpoint_rejects_unknown_interface() {
    let output = reporter()
        .args(["endpoint", "/work/app", "--interface", "pipe"])
        .output()
        .expect("run reporter");
    assert!(!output.status.success());
}

#[test]
fn send_forwards_json_stream_over_address_env() {
    let sockets = TempDir::new().expect("socket dir");
    let socket = sockets.path().join("ide-mocha-app.sock");
    let listener = UnixListener::bind(&socket).expect("bind");

    let mut child = reporter()
        .args(["send", "--format", "json-stream"])
        .env("IDE_MOCHA_ADDRESS", &socket)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reporter");

    let (mut accepted, _) = listener.accept().expect("accept");
    {
        let mut stdin = child.stdin.take().expect("stdin");
        stdin
            .write_all(
                b"[\"start\",{\"total\":2}]\n\
                  [\"pass\",{\"title\":\"adds\",\"fullTitle\":\"math adds\",\"duration\":2}]\n\
                  [\"fail\",{\"title\":\"divides\",\"err\":\"boom\"}]\n\
                  [\"end\",{\"tests\":2,\"duration\":8}]\n",
            )
            .expect("write input");
    }

    let status = child.wait().expect("wait reporter");
    assert!(status.success());

    let mut received = Vec::new();
    accepted.read_to_end(&mut received).expect("read forwarded events");
    let kinds: Vec<EventKind> = received
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| parse_event_line(line).expect("valid event").event)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Start,
            EventKind::Pass,
            EventKind::Fail,
            EventKind::End
        ]
    );
}

#[test]
fn send_fails_without_a_listener() {
    let sockets = TempDir::new().expect("socket dir");
    let status = reporter()
        .args(["send", "--folder", "/work/app", "--socket-dir"])
        .arg(sockets.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run reporter");
    assert!(!status.success());
}
