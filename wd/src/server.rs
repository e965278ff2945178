//! Workflow server: the network interface of a running scheduler
//!
//! A thread owns two TCP listeners speaking JSON-lines: the request port
//! (commands, task messages, external triggers, snapshot queries) and the
//! publish port (data-store delta stream). Producers only ever enqueue into
//! the scheduler's ingest queues; no pool state is touched here.
//!
//! Authentication is a per-workflow secret written by the installer into
//! the service directory; every request carries it.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::datastore::Delta;
use crate::queues::{ExtTriggerMsg, TaskMsg};

/// How long the scheduler waits for the server thread to come up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// One client request, sent as a single JSON line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    Command { payload: serde_json::Value },
    Message { payload: TaskMsg },
    ExtTrigger { trigger: String, id: String },
    Query,
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientResponse {
    Ok,
    Pong { version: String },
    Snapshot { data: serde_json::Value },
    Error { message: String },
}

/// Everything the server needs from the scheduler.
#[derive(Clone)]
pub struct ServerHandles {
    pub command_tx: UnboundedSender<Command>,
    pub message_tx: UnboundedSender<TaskMsg>,
    pub ext_trigger_tx: UnboundedSender<ExtTriggerMsg>,
    pub publish_tx: broadcast::Sender<Vec<Delta>>,
    pub snapshot: Arc<RwLock<serde_json::Value>>,
    pub secret: String,
}

pub struct Server {
    pub port: u16,
    pub pub_port: u16,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Start the server thread; blocks until both listeners are bound or
    /// the startup timeout passes.
    pub fn start(handles: ServerHandles) -> Result<Server> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let req_shutdown = shutdown.clone();
        let req_handles = handles.clone();
        let request_thread = std::thread::Builder::new()
            .name("wd-server".into())
            .spawn(move || {
                if let Err(e) = request_loop(req_handles, req_shutdown, ready_tx) {
                    warn!(error = %e, "server thread exited with error");
                }
            })
            .context("failed to spawn server thread")?;

        let port = ready_rx
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|_| eyre!("server thread did not start within {:?}", STARTUP_TIMEOUT))?;

        let (pub_ready_tx, pub_ready_rx) = std_mpsc::sync_channel(1);
        let pub_shutdown = shutdown.clone();
        let publish_thread = std::thread::Builder::new()
            .name("wd-publisher".into())
            .spawn(move || {
                if let Err(e) = publish_loop(handles, pub_shutdown, pub_ready_tx) {
                    warn!(error = %e, "publisher thread exited with error");
                }
            })
            .context("failed to spawn publisher thread")?;

        let pub_port = pub_ready_rx
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|_| eyre!("publisher thread did not start within {:?}", STARTUP_TIMEOUT))?;

        info!(port, pub_port, "server listening");
        Ok(Server {
            port,
            pub_port,
            shutdown,
            threads: vec![request_thread, publish_thread],
        })
    }

    /// Stop the listener threads.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        debug!("server stopped");
    }
}

fn nonblocking_listener() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind listener")?;
    let port = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;
    Ok((listener, port))
}

fn request_loop(
    handles: ServerHandles,
    shutdown: Arc<AtomicBool>,
    ready_tx: std_mpsc::SyncSender<u16>,
) -> Result<()> {
    let (listener, port) = nonblocking_listener()?;
    let _ = ready_tx.send(port);
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_client(stream, &handles) {
                    debug!(error = %e, "client connection error");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn handle_client(stream: TcpStream, handles: &ServerHandles) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        let response = dispatch_request(&line, handles);
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes())?;
    }
    Ok(())
}

fn dispatch_request(line: &str, handles: &ServerHandles) -> ClientResponse {
    #[derive(Deserialize)]
    struct Envelope {
        auth: String,
        #[serde(flatten)]
        request: ClientRequest,
    }
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            return ClientResponse::Error {
                message: format!("bad request: {}", e),
            };
        }
    };
    if envelope.auth != handles.secret {
        warn!("rejected request with bad credentials");
        return ClientResponse::Error {
            message: "authentication failed".into(),
        };
    }
    match envelope.request {
        ClientRequest::Command { payload } => {
            let json = payload.to_string();
            match Command::from_json(&json) {
                Ok(command) => {
                    debug!(command = %command.describe(), "command received");
                    let _ = handles.command_tx.send(command);
                    ClientResponse::Ok
                }
                Err(e) => ClientResponse::Error { message: e.to_string() },
            }
        }
        ClientRequest::Message { payload } => {
            let _ = handles.message_tx.send(payload);
            ClientResponse::Ok
        }
        ClientRequest::ExtTrigger { trigger, id } => {
            let _ = handles.ext_trigger_tx.send(ExtTriggerMsg { trigger, id });
            ClientResponse::Ok
        }
        ClientRequest::Query => {
            let data = handles.snapshot.read().map(|s| s.clone()).unwrap_or_default();
            ClientResponse::Snapshot { data }
        }
        ClientRequest::Ping => ClientResponse::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

fn publish_loop(
    handles: ServerHandles,
    shutdown: Arc<AtomicBool>,
    ready_tx: std_mpsc::SyncSender<u16>,
) -> Result<()> {
    let (listener, port) = nonblocking_listener()?;
    let _ = ready_tx.send(port);
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let rx = handles.publish_tx.subscribe();
                let sub_shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    let _ = feed_subscriber(stream, rx, sub_shutdown);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn feed_subscriber(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<Vec<Delta>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.blocking_recv() {
            Ok(deltas) => {
                let mut line = serde_json::to_string(&deltas)?;
                line.push('\n');
                stream.write_all(line.as_bytes())?;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "publish subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

// === Contact file ===

/// Serialised key=value file marking a running scheduler instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactFile {
    pub fields: Vec<(String, String)>,
}

impl ContactFile {
    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(".service").join("contact")
    }

    /// Refuse to start if another instance's contact file is present.
    pub fn detect_old(run_dir: &Path) -> Result<()> {
        let path = Self::path(run_dir);
        if path.exists() {
            return Err(eyre!(
                "contact file exists: {} (is the workflow already running?)",
                path.display()
            ));
        }
        Ok(())
    }

    pub fn write(&self, run_dir: &Path) -> Result<()> {
        let path = Self::path(run_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = String::new();
        for (key, value) in &self.fields {
            content.push_str(&format!("{}={}\n", key, value));
        }
        std::fs::write(&path, content).context("failed to write contact file")?;
        debug!(path = %path.display(), "contact file written");
        Ok(())
    }

    pub fn remove(run_dir: &Path) -> Result<()> {
        let path = Self::path(run_dir);
        if path.exists() {
            std::fs::remove_file(&path).context("failed to remove contact file")?;
        }
        Ok(())
    }

    pub fn load(run_dir: &Path) -> Result<ContactFile> {
        let content = std::fs::read_to_string(Self::path(run_dir))?;
        let fields = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(ContactFile { fields })
    }
}
