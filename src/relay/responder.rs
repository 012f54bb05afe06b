// src/relay/responder.rs
//! Worker side of the relay
//!
//! A worker process builds a [`Responder`], then loops on
//! [`Responder::next_request`] until it returns `None`:
//!
//! ```no_run
//! # async fn run() -> relay_pool::Result<()> {
//! use relay_pool::relay::Responder;
//!
//! let mut responder = Responder::from_env().await?;
//! while let Some(request) = responder.next_request().await? {
//!     responder.respond(request).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Handshake and stop control frames are handled internally.

use crate::payload::Payload;
use crate::relay::{ControlMessage, Frame, FramedRelay, PidCommand, Relay, SOCKET_ENV};
use crate::utils::errors::{PoolError, Result};
use std::path::Path;
use tokio::net::UnixStream;
use tracing::debug;

pub struct Responder {
    relay: Box<dyn Relay>,
}

impl Responder {
    /// Serve over stdin/stdout
    pub fn from_stdio() -> Self {
        Self::new(Box::new(FramedRelay::new(
            tokio::io::stdin(),
            tokio::io::stdout(),
        )))
    }

    /// Connect to the pool's socket and announce this process
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await.map_err(|e| {
            PoolError::Network(format!(
                "failed to connect to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let (read, write) = stream.into_split();

        let mut relay = FramedRelay::new(read, write);
        relay.send(Frame::control(&own_pid())?).await?;

        Ok(Self::new(Box::new(relay)))
    }

    /// Socket if the pool exported one, stdio otherwise
    pub async fn from_env() -> Result<Self> {
        match std::env::var_os(SOCKET_ENV) {
            Some(path) => Self::connect(path).await,
            None => Ok(Self::from_stdio()),
        }
    }

    pub fn new(relay: Box<dyn Relay>) -> Self {
        Self { relay }
    }

    /// Next request from the pool
    ///
    /// Returns `None` when the pool asks the worker to stop or closes the relay.
    pub async fn next_request(&mut self) -> Result<Option<Payload>> {
        loop {
            let Some(frame) = self.relay.receive().await? else {
                return Ok(None);
            };

            if !frame.is_control() {
                return Ok(Some(frame.into_payload()));
            }

            match frame.parse_control::<ControlMessage>()? {
                ControlMessage::Pid(hello) => {
                    debug!(pool_pid = hello.pid, "Handshake");
                    self.relay.send(Frame::control(&own_pid())?).await?;
                }
                ControlMessage::Stop(stop) if stop.stop => return Ok(None),
                ControlMessage::Stop(_) => {}
            }
        }
    }

    pub async fn respond(&mut self, payload: Payload) -> Result<()> {
        self.relay.send(Frame::from(&payload)).await
    }

    /// Report an application error; the pool keeps this worker
    pub async fn respond_error(&mut self, message: impl Into<String>) -> Result<()> {
        self.relay.send(Frame::error(message)).await
    }

    /// Ask the pool to replace this worker and re-issue the request
    pub async fn request_restart(&mut self) -> Result<()> {
        self.respond(Payload::stop_request()).await
    }
}

fn own_pid() -> PidCommand {
    PidCommand {
        pid: std::process::id(),
    }
}
