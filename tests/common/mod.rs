//! Shared test doubles: an in-memory ZFS host model plus stream fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use zmigrate::error::{Result, ZmigrateError};
use zmigrate::zfs::{CommandOutput, CommandRunner, ProcessHandle, TransferProcess};

#[derive(Default)]
struct HostState {
    /// dataset -> snapshot names in creation order.
    snapshots: HashMap<String, Vec<String>>,
    /// (dataset, property) -> value.
    properties: HashMap<(String, String), String>,
    /// "dataset@snapshot" -> hold tags.
    holds: HashMap<String, Vec<String>>,
    send_payload: Vec<u8>,
    estimate: Option<u64>,
    received: Arc<Mutex<Vec<u8>>>,
    calls: Vec<String>,
    fail_hold: bool,
    /// Send stream that never produces data, for cancellation tests.
    send_hang: bool,
    send_exit: CommandOutput,
    receive_exit: CommandOutput,
}

/// Scripted stand-in for a host's ZFS state. Interprets the same argv
/// lines the real runner would execute.
pub struct FakeHost {
    state: Mutex<HostState>,
    pub send_terminated: Arc<AtomicBool>,
    pub receive_terminated: Arc<AtomicBool>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState::default()),
            send_terminated: Arc::new(AtomicBool::new(false)),
            receive_terminated: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn add_snapshot(&self, dataset: &str, snapshot: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .snapshots
            .entry(dataset.to_string())
            .or_default()
            .push(snapshot.to_string());
    }

    pub fn set_property(&self, dataset: &str, property: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .properties
            .insert((dataset.to_string(), property.to_string()), value.to_string());
    }

    pub fn add_hold(&self, dataset: &str, snapshot: &str, tag: &str) {
        self.state
            .lock()
            .unwrap()
            .holds
            .entry(format!("{dataset}@{snapshot}"))
            .or_default()
            .push(tag.to_string());
    }

    /// All (snapshot, tag) holds on the dataset.
    pub fn holds(&self, dataset: &str) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (target, tags) in &state.holds {
            if let Some((ds, snap)) = target.split_once('@') {
                if ds == dataset {
                    for tag in tags {
                        out.push((snap.to_string(), tag.clone()));
                    }
                }
            }
        }
        out.sort();
        out
    }

    pub fn set_send_payload(&self, payload: &[u8]) {
        self.state.lock().unwrap().send_payload = payload.to_vec();
    }

    pub fn set_estimate(&self, bytes: u64) {
        self.state.lock().unwrap().estimate = Some(bytes);
    }

    pub fn set_fail_hold(&self, fail: bool) {
        self.state.lock().unwrap().fail_hold = fail;
    }

    pub fn set_send_hang(&self, hang: bool) {
        self.state.lock().unwrap().send_hang = hang;
    }

    pub fn set_receive_exit(&self, code: i32, stderr: &str) {
        self.state.lock().unwrap().receive_exit = CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            code,
        };
    }

    pub fn received(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let received = state.received.lock().unwrap();
        received.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with("spawn:"))
            .count()
    }
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        stdout,
        stderr: String::new(),
        code: 0,
    }
}

fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        code: 1,
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(argv.join(" "));

        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = match args.as_slice() {
            // snapshot existence check
            ["zfs", "list", "-t", "snapshot", "-H", target] => {
                match target.split_once('@') {
                    Some((ds, snap))
                        if state
                            .snapshots
                            .get(ds)
                            .is_some_and(|s| s.iter().any(|x| x == snap)) =>
                    {
                        ok(format!("{target}\n"))
                    }
                    _ => fail("dataset does not exist"),
                }
            }
            // snapshot listing, creation order
            ["zfs", "list", "-t", "snapshot", "-H", "-o", "name", "-s", "creation", "-d", "1", dataset] => {
                match state.snapshots.get(*dataset) {
                    Some(snaps) => ok(snaps
                        .iter()
                        .map(|s| format!("{dataset}@{s}\n"))
                        .collect::<String>()),
                    None => fail("dataset does not exist"),
                }
            }
            ["zfs", "list", "-H", dataset] => {
                if state.snapshots.contains_key(*dataset) {
                    ok(format!("{dataset}\n"))
                } else {
                    fail("dataset does not exist")
                }
            }
            ["zfs", "get", "-H", "-o", "value", property, dataset] => {
                match state
                    .properties
                    .get(&(dataset.to_string(), property.to_string()))
                {
                    Some(value) => ok(format!("{value}\n")),
                    None => ok("-\n".to_string()),
                }
            }
            ["zfs", "send", "-nvP", ..] => match state.estimate {
                Some(bytes) => ok(format!("size\t{bytes}\n")),
                None => ok(String::new()),
            },
            ["zfs", "hold", tag, target] => {
                if state.fail_hold {
                    fail("cannot hold: permission denied")
                } else {
                    let tag = tag.to_string();
                    let target = target.to_string();
                    state.holds.entry(target).or_default().push(tag);
                    ok(String::new())
                }
            }
            ["zfs", "release", tag, target] => {
                let found = state
                    .holds
                    .get_mut(*target)
                    .map(|tags| {
                        let before = tags.len();
                        tags.retain(|t| t != tag);
                        before != tags.len()
                    })
                    .unwrap_or(false);
                if found {
                    ok(String::new())
                } else {
                    fail("no such tag on this dataset")
                }
            }
            ["zfs", "holds", "-H", target] => match state.holds.get(*target) {
                Some(tags) => ok(tags
                    .iter()
                    .map(|t| format!("{target}\t{t}\tThu Jan  1 00:00 2026\n"))
                    .collect::<String>()),
                None => ok(String::new()),
            },
            _ => ok(String::new()),
        };
        Ok(out)
    }

    async fn spawn(&self, argv: &[String], want_stdin: bool) -> Result<TransferProcess> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("spawn: {}", argv.join(" ")));

        if want_stdin {
            let writer = SharedWriter(state.received.clone());
            Ok(TransferProcess {
                stdout: None,
                stdin: Some(Box::new(writer)),
                handle: Box::new(FakeHandle {
                    exit: state.receive_exit.clone(),
                    terminated: self.receive_terminated.clone(),
                }),
            })
        } else {
            let reader: Box<dyn AsyncRead + Send + Unpin> = if state.send_hang {
                Box::new(PendingReader)
            } else {
                Box::new(Cursor::new(state.send_payload.clone()))
            };
            Ok(TransferProcess {
                stdout: Some(reader),
                stdin: None,
                handle: Box::new(FakeHandle {
                    exit: state.send_exit.clone(),
                    terminated: self.send_terminated.clone(),
                }),
            })
        }
    }
}

struct FakeHandle {
    exit: CommandOutput,
    terminated: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    async fn wait(&mut self) -> Result<CommandOutput> {
        Ok(self.exit.clone())
    }

    async fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Appends every write to a shared buffer.
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A read that never completes; stands in for a stalled send stream.
pub struct PendingReader;

impl AsyncRead for PendingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

/// Connector whose every dial fails, for unreachable-remote scenarios.
pub struct FailingConnector;

#[async_trait]
impl zmigrate::transport::Connector for FailingConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn zmigrate::transport::DataStream>> {
        Err(ZmigrateError::TransferFailed(format!(
            "connect to {host}: connection refused"
        )))
    }
}

/// Hands out a pre-built stream once; the other half lives in the test.
pub struct OneShotConnector(pub Mutex<Option<Box<dyn zmigrate::transport::DataStream>>>);

#[async_trait]
impl zmigrate::transport::Connector for OneShotConnector {
    async fn connect(&self, _host: &str) -> Result<Box<dyn zmigrate::transport::DataStream>> {
        self.0
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ZmigrateError::TransferFailed("no stream scripted".into()))
    }
}
