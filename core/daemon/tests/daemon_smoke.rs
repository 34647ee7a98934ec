use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use ide_mocha_protocol::{encode_event_line, ClientEvent, ErrorDetail, TestInfo};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path, config: &Path, folder: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_ide-mocha-daemon"))
        .env("HOME", home)
        .arg("--config")
        .arg(config)
        .arg("--folder")
        .arg(folder)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn ide-mocha-daemon");
    DaemonGuard { child }
}

fn write_config(home: &Path, socket_dir: &Path) -> PathBuf {
    let path = home.join("config.toml");
    std::fs::write(
        &path,
        format!(
            "[general]\nsocket_dir = \"{}\"\nverbosity = \"quiet\"\n",
            socket_dir.display()
        ),
    )
    .expect("write config");
    path
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for remote socket at {}", path.display());
}

fn send_events(socket: &Path, events: &[ClientEvent]) {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to remote socket");
    for event in events {
        let line = encode_event_line(event).expect("encode event");
        stream.write_all(&line).expect("Failed to write event");
    }
    stream.flush().ok();
}

/// Asks for `status` until the folder's line reports `expected`.
fn wait_for_status(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    folder: &Path,
    expected: &str,
) {
    let prefix = folder.display().to_string();
    for _ in 0..200 {
        writeln!(stdin, "status").expect("write status command");
        stdin.flush().expect("flush stdin");

        let mut line = String::new();
        loop {
            line.clear();
            let read = stdout.read_line(&mut line).expect("read daemon output");
            assert!(read > 0, "daemon closed stdout");
            if line.starts_with(&prefix) {
                break;
            }
        }
        if line.contains(expected) {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("folder never reached status {}", expected);
}

#[test]
fn daemon_serves_folder_and_cleans_up_on_quit() {
    let home = TempDir::new().expect("home dir");
    let sockets = TempDir::new().expect("socket dir");
    let folder = home.path().join("app");
    let config = write_config(home.path(), sockets.path());
    let socket = sockets.path().join("ide-mocha-app.sock");

    let mut daemon = spawn_daemon(home.path(), &config, &folder);
    let mut stdin = daemon.child.stdin.take().expect("daemon stdin");
    let mut stdout = BufReader::new(daemon.child.stdout.take().expect("daemon stdout"));
    wait_for_socket(&socket, Duration::from_secs(5));

    send_events(
        &socket,
        &[
            ClientEvent::start(),
            ClientEvent::pass(TestInfo::named("adds")),
            ClientEvent::pass(TestInfo::named("subtracts")),
            ClientEvent::fail(
                TestInfo::named("divides"),
                ErrorDetail {
                    message: "expected 1 to equal 2".to_string(),
                    ..ErrorDetail::default()
                },
            ),
            ClientEvent::end(Some(9)),
        ],
    );
    wait_for_status(&mut stdin, &mut stdout, &folder, "[failed (1 failing)]");

    writeln!(stdin, "copy-address {}", folder.display()).expect("write command");
    stdin.flush().expect("flush stdin");
    let mut address = String::new();
    loop {
        address.clear();
        stdout.read_line(&mut address).expect("read address");
        if address.trim() == socket.display().to_string() {
            break;
        }
        assert!(!address.is_empty(), "daemon closed stdout");
    }

    writeln!(stdin, "quit").expect("write quit");
    drop(stdin);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = daemon.child.try_wait().expect("poll daemon") {
            assert!(status.success());
            break;
        }
        assert!(Instant::now() < deadline, "daemon did not exit after quit");
        sleep(Duration::from_millis(25));
    }
    assert!(!socket.exists(), "socket file left behind after quit");
}
