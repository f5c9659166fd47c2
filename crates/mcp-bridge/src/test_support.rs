//! In-memory MCP child used by supervisor, handshake and HTTP tests.
//!
//! Each spawn starts a task speaking NDJSON over `tokio::io::duplex` pipes.
//! Besides the MCP methods it understands a few `test/*` methods that
//! misbehave on purpose.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::spawner::{ChildSpawner, SpawnError, SpawnedChild};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    pub initialize_delay: Duration,
    /// Reject this many `initialize` requests (across all spawns) before accepting.
    pub reject_initialize: u32,
    pub ignore_initialize: bool,
    /// Write protocol-looking junk to stderr on startup.
    pub stderr_noise: bool,
    /// Close stdin before the bridge sees the child so every write fails.
    pub close_stdin: bool,
    /// Never read stdin; writes block once the pipe buffer is full.
    pub stall_stdin: bool,
}

struct FakeShared {
    behavior: FakeBehavior,
    rejections_left: AtomicU32,
    lines_written: AtomicUsize,
    received: StdMutex<Vec<Value>>,
}

pub struct FakeSpawner {
    shared: Arc<FakeShared>,
    fail_spawns: AtomicBool,
    spawns: AtomicUsize,
    current: StdMutex<Option<CancellationToken>>,
}

impl FakeSpawner {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(FakeShared {
                rejections_left: AtomicU32::new(behavior.reject_initialize),
                behavior,
                lines_written: AtomicUsize::new(0),
                received: StdMutex::new(Vec::new()),
            }),
            fail_spawns: AtomicBool::new(false),
            spawns: AtomicUsize::new(0),
            current: StdMutex::new(None),
        })
    }

    /// Successful spawns so far.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn set_fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    /// Make the most recent child exit.
    pub fn kill_current(&self) {
        if let Some(kill) = self.current.lock().unwrap().as_ref() {
            kill.cancel();
        }
    }

    /// Every message any child has read from its stdin, in order.
    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn count_method(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    /// Lines the children have written to stdout.
    pub fn responses_sent(&self) -> usize {
        self.shared.lines_written.load(Ordering::SeqCst)
    }

    /// Wait until `expected` shows up in the method log, in that order.
    pub async fn wait_for_methods(&self, expected: &[&str]) {
        wait_until(|| {
            let methods = self.methods();
            let mut remaining = methods.iter();
            expected
                .iter()
                .all(|want| remaining.any(|seen| seen.as_str() == *want))
        })
        .await;
    }
}

impl ChildSpawner for FakeSpawner {
    fn spawn(&self) -> Result<SpawnedChild, SpawnError> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(SpawnError::Other("fake spawn failure".to_string()));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (bridge_stdin, child_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (child_stdout, bridge_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (child_stderr, bridge_stderr) = tokio::io::duplex(PIPE_CAPACITY);

        let kill = CancellationToken::new();
        *self.current.lock().unwrap() = Some(kill.clone());

        let behavior = &self.shared.behavior;
        if behavior.close_stdin || behavior.stall_stdin {
            let stdin = if behavior.close_stdin {
                drop(child_stdin);
                None
            } else {
                Some(child_stdin)
            };
            // Keep the remaining pipes open until killed, answering nothing.
            tokio::spawn(async move {
                let _held = (stdin, child_stdout, child_stderr);
                kill.cancelled().await;
            });
        } else {
            tokio::spawn(run_fake_child(
                Arc::clone(&self.shared),
                child_stdin,
                child_stdout,
                child_stderr,
                kill,
            ));
        }

        Ok(SpawnedChild::from_pipes(bridge_stdin, bridge_stdout).with_stderr(bridge_stderr))
    }
}

/// Test defaults: fast backoff, short timeouts.
pub fn test_config() -> BridgeConfig {
    BridgeConfig::default()
        .with_base_backoff(Duration::from_millis(10))
        .with_request_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2))
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type Outbox = mpsc::UnboundedSender<String>;

fn send_line(out: &Outbox, message: Value) {
    let _ = out.send(format!("{message}\n"));
}

fn send_result(out: &Outbox, id: Value, result: Value) {
    send_line(out, json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn send_error(out: &Outbox, id: Value, code: i64, message: &str) {
    send_line(
        out,
        json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    );
}

async fn run_fake_child(
    shared: Arc<FakeShared>,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    kill: CancellationToken,
) {
    let (out, mut outbox) = mpsc::unbounded_channel::<String>();
    let writer = {
        let shared = Arc::clone(&shared);
        let kill = kill.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = kill.cancelled() => break,
                    line = outbox.recv() => {
                        let Some(line) = line else { break };
                        if stdout.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        shared.lines_written.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        })
    };

    if shared.behavior.stderr_noise {
        let noise = "fake-mcp starting\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"source\":\"stderr\"}}\n";
        let _ = stderr.write_all(noise.as_bytes()).await;
    }

    let mut lines = BufReader::new(stdin).lines();
    loop {
        let line = tokio::select! {
            _ = kill.cancelled() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        shared.received.lock().unwrap().push(message.clone());

        let (Some(id), Some(method)) = (
            message.get("id").cloned(),
            message.get("method").and_then(Value::as_str),
        ) else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        handle_request(&shared, &out, &mut stderr, &kill, id, method, params).await;
    }

    // stdin closed or killed: the child is gone either way.
    kill.cancel();
    drop(out);
    let _ = writer.await;
}

async fn handle_request(
    shared: &FakeShared,
    out: &Outbox,
    stderr: &mut DuplexStream,
    kill: &CancellationToken,
    id: Value,
    method: &str,
    params: Value,
) {
    match method {
        "initialize" => {
            if shared.behavior.ignore_initialize {
                return;
            }
            let rejected = shared
                .rejections_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let delay = shared.behavior.initialize_delay;
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if rejected {
                    send_error(&out, id, -32602, "unsupported protocol version");
                } else {
                    send_result(
                        &out,
                        id,
                        json!({
                            "protocolVersion": params["protocolVersion"],
                            "capabilities": {"tools": {}, "resources": {}},
                            "serverInfo": {"name": "fake-mcp", "version": "0.0.1"},
                        }),
                    );
                }
            });
        }
        "ping" => send_result(out, id, json!({})),
        "tools/list" => send_result(
            out,
            id,
            json!({"tools": [{
                "name": "echo",
                "description": "Echo the arguments back",
                "inputSchema": {"type": "object"},
            }]}),
        ),
        "tools/call" => send_result(
            out,
            id,
            json!({"content": [{"type": "text", "text": "echo"}], "echo": params}),
        ),
        "resources/list" => send_result(
            out,
            id,
            json!({"resources": [{"uri": "mem://greeting", "name": "greeting"}]}),
        ),
        "resources/read" => send_result(
            out,
            id,
            json!({"contents": [{"uri": params["uri"], "text": "hello"}]}),
        ),
        "test/hang" => {}
        "test/sleep" => {
            let delay = Duration::from_millis(params["delay_ms"].as_u64().unwrap_or(0));
            let tag = params["tag"].clone();
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                send_result(&out, id, json!({"tag": tag}));
            });
        }
        "test/crash" => kill.cancel(),
        "test/garbage" => {
            let _ = out.send("this is not json\n".to_string());
            let _ = out.send("{\"truncated\": \n".to_string());
            let _ = out.send("{\"unexpected\":true}\n".to_string());
            send_result(out, id, json!({"ok": true}));
        }
        "test/stderr" => {
            let fake = json!({"jsonrpc": "2.0", "id": id, "result": {"source": "stderr"}});
            let _ = stderr.write_all(format!("{fake}\n").as_bytes()).await;
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                send_result(&out, id, json!({"source": "stdout"}));
            });
        }
        "test/ping_me" => {
            send_line(out, json!({"jsonrpc": "2.0", "id": "srv-ping", "method": "ping"}));
            send_result(out, id, json!({"ok": true}));
        }
        other => send_error(out, id, -32601, &format!("Method not found: {other}")),
    }
}
