// src/relay/socket.rs
//! Relay over a Unix domain socket
//!
//! The factory listens on a socket path and exports it to workers through
//! [`SOCKET_ENV`]. A worker connects back and announces itself with a
//! `{"pid":N}` control frame; the connection is then routed to the spawn
//! waiting for that pid, and the regular pid handshake runs over it.

use crate::events::EventBus;
use crate::relay::{FramedRelay, PidCommand, Relay, RelayFactory};
use crate::runtime::process_manager::CommandSpec;
use crate::runtime::worker::Worker;
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable carrying the socket path to workers
pub const SOCKET_ENV: &str = "RELAY_POOL_SOCKET";

/// Time a connecting worker gets to announce its pid
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

type SocketRelay = FramedRelay<OwnedReadHalf, OwnedWriteHalf>;

enum Slot {
    /// A spawn is waiting for this pid to connect
    Waiting(oneshot::Sender<SocketRelay>),
    /// The worker connected before its spawn registered
    Arrived(SocketRelay),
}

/// Spawns workers that connect back over a Unix socket
pub struct SocketFactory {
    path: PathBuf,
    slots: Arc<DashMap<u32, Slot>>,
    accept_task: JoinHandle<()>,
}

impl SocketFactory {
    /// Bind `path` and start accepting worker connections
    ///
    /// A stale socket file at `path` is replaced. Must be called from
    /// within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!("Listening for workers on {}", path.display());

        let slots = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&slots)));

        Ok(Self {
            path,
            slots,
            accept_task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register interest in `pid`; returns the relay if it already arrived
    fn claim(&self, pid: u32) -> std::result::Result<SocketRelay, oneshot::Receiver<SocketRelay>> {
        match self.slots.entry(pid) {
            Entry::Occupied(entry) => match entry.remove() {
                Slot::Arrived(relay) => Ok(relay),
                Slot::Waiting(_) => {
                    // a previous process with the same pid never connected
                    let (tx, rx) = oneshot::channel();
                    self.slots.insert(pid, Slot::Waiting(tx));
                    Err(rx)
                }
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(Slot::Waiting(tx));
                Err(rx)
            }
        }
    }
}

impl Drop for SocketFactory {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl RelayFactory for SocketFactory {
    async fn spawn_worker(&self, command: CommandSpec, events: Arc<EventBus>) -> Result<Worker> {
        debug!("Spawning socket worker: {}", command);

        let child = command
            .env(SOCKET_ENV, &self.path)
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PoolError::WorkerAllocate(format!("failed to spawn worker: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| PoolError::WorkerAllocate("worker exited immediately".to_string()))?;

        // unregisters the pid if this spawn is abandoned
        let _guard = SlotGuard {
            slots: &self.slots,
            pid,
        };

        let relay = match self.claim(pid) {
            Ok(relay) => relay,
            Err(rx) => rx.await.map_err(|_| {
                PoolError::WorkerAllocate(format!("socket listener closed before pid {} connected", pid))
            })?,
        };

        Worker::start(child, Box::new(relay), events).await
    }
}

struct SlotGuard<'a> {
    slots: &'a DashMap<u32, Slot>,
    pid: u32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .remove_if(&self.pid, |_, slot| matches!(slot, Slot::Waiting(_)));
    }
}

async fn accept_loop(listener: UnixListener, slots: Arc<DashMap<u32, Slot>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(route(stream, Arc::clone(&slots)));
            }
            Err(e) => {
                warn!("Failed to accept worker connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read the worker's announcement and hand the connection to its spawn
async fn route(stream: UnixStream, slots: Arc<DashMap<u32, Slot>>) {
    let (read, write) = stream.into_split();
    let mut relay = FramedRelay::new(read, write);

    let announced = match tokio::time::timeout(ANNOUNCE_TIMEOUT, relay.receive()).await {
        Ok(Ok(Some(frame))) => frame.parse_control::<PidCommand>(),
        Ok(Ok(None)) => return,
        Ok(Err(e)) => Err(e),
        Err(_) => Err(PoolError::Network("worker did not announce its pid".to_string())),
    };

    let pid = match announced {
        Ok(command) => command.pid,
        Err(e) => {
            warn!("Dropping worker connection: {}", e);
            return;
        }
    };

    match slots.entry(pid) {
        Entry::Occupied(entry) => match entry.remove() {
            Slot::Waiting(tx) => {
                if tx.send(relay).is_err() {
                    debug!(pid, "Spawn abandoned before the worker connected");
                }
            }
            Slot::Arrived(_) => {
                warn!(pid, "Duplicate connection for worker, dropping both");
            }
        },
        Entry::Vacant(entry) => {
            entry.insert(Slot::Arrived(relay));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Frame;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.sock");
        std::fs::write(&path, b"stale").unwrap();

        let factory = SocketFactory::bind(&path).unwrap();
        assert_eq!(factory.path(), path.as_path());
        assert!(path.exists());

        drop(factory);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_early_connection_is_parked() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SocketFactory::bind(dir.path().join("pool.sock")).unwrap();

        let stream = UnixStream::connect(factory.path()).await.unwrap();
        let (read, write) = stream.into_split();
        let mut worker = FramedRelay::new(read, write);
        worker
            .send(Frame::control(&PidCommand { pid: 99999 }).unwrap())
            .await
            .unwrap();

        // the route task parks the connection since no spawn waits for it
        let mut parked = false;
        for _ in 0..100 {
            if factory.slots.contains_key(&99999) {
                parked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(parked);
        assert!(factory.claim(99999).is_ok());
    }
}
