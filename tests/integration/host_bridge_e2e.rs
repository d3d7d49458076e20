//! End-to-end tests for the `recurra-host` binary over stdin/stdout.

use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

struct HostBridgeHarness {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    reader: Lines<BufReader<ChildStdout>>,
    /// Events read while waiting for a response.
    pending: Vec<Value>,
    data: tempfile::TempDir,
    _config: tempfile::TempDir,
}

impl HostBridgeHarness {
    fn spawn() -> Self {
        let data = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let mut child = Command::new(env!("CARGO_BIN_EXE_recurra-host"))
            .env("RECURRA_DATA_DIR", data.path())
            .env("RECURRA_CONFIG_DIR", config.path())
            .env("RUST_LOG", "off")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn recurra-host");

        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin: BufWriter::new(stdin),
            reader: BufReader::new(stdout).lines(),
            pending: Vec::new(),
            data,
            _config: config,
        }
    }

    fn data_dir(&self) -> &std::path::Path {
        self.data.path()
    }

    async fn write(&mut self, line: &str) {
        self.stdin.write_all(line.as_bytes()).await.unwrap();
        self.stdin.write_all(b"\n").await.unwrap();
        self.stdin.flush().await.unwrap();
    }

    /// Send a command and return its response, skipping events.
    async fn send(&mut self, request_id: &str, command: &str, payload: Value) -> Value {
        let envelope = json!({
            "v": 1,
            "request_id": request_id,
            "command": command,
            "payload": payload,
        });
        self.write(&envelope.to_string()).await;
        loop {
            let line = self.read_line().await;
            if line.get("ok").is_some() {
                return line;
            }
            self.pending.push(line);
        }
    }

    async fn read_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), self.reader.next_line())
            .await
            .expect("timeout reading from recurra-host")
            .expect("IO error reading from recurra-host")
            .expect("unexpected EOF from recurra-host");
        serde_json::from_str(&line)
            .unwrap_or_else(|e| panic!("invalid JSON from recurra-host: {e}\nraw line: {line}"))
    }

    async fn next_event(&mut self, name: &str) -> Value {
        if let Some(index) = self.pending.iter().position(|line| line["event"] == name) {
            return self.pending.remove(index);
        }
        loop {
            let line = self.read_line().await;
            if line["event"] == name {
                return line;
            }
        }
    }

    async fn wait_for_exit(&mut self) -> std::process::ExitStatus {
        tokio::time::timeout(Duration::from_secs(10), self.child.wait())
            .await
            .expect("recurra-host did not exit")
            .expect("wait on recurra-host")
    }
}

#[tokio::test]
async fn ping_and_stop() {
    let mut host = HostBridgeHarness::spawn();
    let pong = host.send("p", "host.ping", json!({})).await;
    assert_eq!(pong["ok"], true);
    assert_eq!(pong["payload"]["pong"], true);

    let stop = host.send("s", "runtime.stop", json!({})).await;
    assert_eq!(stop["ok"], true);
    assert!(host.wait_for_exit().await.success());
}

#[tokio::test]
async fn shell_job_runs_and_persists() {
    let mut host = HostBridgeHarness::spawn();
    let created = host
        .send(
            "c",
            "jobs.create",
            json!({
                "name": "greeter",
                "query": "echo working >&2; echo hello from recurra",
                "schedule": {"kind": "daily", "time": "23:59"}
            }),
        )
        .await;
    assert_eq!(created["ok"], true, "{created}");
    let id = created["payload"]["job"]["id"].as_str().unwrap().to_owned();

    let started = host.send("r", "runs.run_now", json!({"id": id})).await;
    assert_eq!(started["ok"], true, "{started}");
    let finished = host.next_event("run.finished").await;
    assert_eq!(finished["payload"]["status"], "completed");
    assert_eq!(finished["payload"]["result"], "hello from recurra");

    let runs = host.send("l", "runs.list", json!({"job_id": id})).await;
    let run = &runs["payload"]["runs"][0];
    assert_eq!(run["final_answer"], "hello from recurra");
    assert_eq!(run["execution_log"][0], "working");

    let data_dir = host.data_dir().to_path_buf();
    host.send("s", "runtime.stop", json!({})).await;
    assert!(host.wait_for_exit().await.success());

    let jobs: Value =
        serde_json::from_str(&std::fs::read_to_string(data_dir.join("jobs.json")).unwrap())
            .unwrap();
    assert_eq!(jobs["items"][0]["id"], id.as_str());
}

#[tokio::test]
async fn garbage_input_is_answered_not_fatal() {
    let mut host = HostBridgeHarness::spawn();
    host.write("{ not json").await;
    let parse_error = host.read_line().await;
    assert_eq!(parse_error["request_id"], "parse-error");
    assert_eq!(parse_error["ok"], false);

    let pong = host.send("p", "host.ping", json!({})).await;
    assert_eq!(pong["ok"], true);
    host.send("s", "runtime.stop", json!({})).await;
    assert!(host.wait_for_exit().await.success());
}
