// src/relay/mod.rs
//! Framed transport between the pool and its workers
//!
//! A relay carries [`Frame`]s over a byte stream. Two transports exist:
//! the worker's stdin/stdout ([`PipeFactory`]) and a Unix domain socket
//! the worker connects back to ([`SocketFactory`]). Either way the first
//! exchange is a pid handshake: the pool sends `{"pid":<pool pid>}` as a
//! control frame and the worker answers with its own pid.

pub mod codec;
pub mod pipe;
pub mod responder;
pub mod socket;

pub use codec::{FrameCodec, MAX_FRAME_LENGTH};
pub use pipe::PipeFactory;
pub use responder::Responder;
pub use socket::{SocketFactory, SOCKET_ENV};

use crate::events::EventBus;
use crate::payload::Payload;
use crate::runtime::process_manager::CommandSpec;
use crate::runtime::worker::Worker;
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Frame flag bits
pub mod flags {
    /// Body is a JSON control message
    pub const CONTROL: u8 = 0x01;
    /// Body is an application error message
    pub const ERROR: u8 = 0x02;
}

/// Unit of transmission on a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub context: Bytes,
    pub body: Bytes,
}

impl Frame {
    /// Plain data frame
    pub fn data(context: Bytes, body: Bytes) -> Self {
        Self {
            flags: 0,
            context,
            body,
        }
    }

    /// Application error reported by a worker
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            flags: flags::ERROR,
            context: Bytes::new(),
            body: Bytes::from(message.into()),
        }
    }

    /// JSON control message
    pub fn control<T: Serialize>(message: &T) -> Result<Self> {
        Ok(Self {
            flags: flags::CONTROL,
            context: Bytes::new(),
            body: Bytes::from(serde_json::to_vec(message)?),
        })
    }

    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & flags::ERROR != 0
    }

    /// Decode the body of a control frame
    pub fn parse_control<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_control() {
            return Err(PoolError::Decode("expected a control frame".to_string()));
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| PoolError::Decode(format!("invalid control message: {}", e)))
    }

    pub fn into_payload(self) -> Payload {
        Payload {
            context: self.context,
            body: self.body,
        }
    }
}

impl From<&Payload> for Frame {
    fn from(payload: &Payload) -> Self {
        Frame::data(payload.context.clone(), payload.body.clone())
    }
}

/// Pid handshake message, sent by both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidCommand {
    pub pid: u32,
}

/// Graceful stop instruction sent to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub stop: bool,
}

/// Any control message understood by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Pid(PidCommand),
    Stop(StopCommand),
}

/// Bidirectional framed channel to a worker
#[async_trait]
pub trait Relay: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next frame, or `None` once the peer closed the stream
    async fn receive(&mut self) -> Result<Option<Frame>>;

    /// Flush and close the write half
    async fn close(&mut self) -> Result<()>;
}

/// [`Relay`] over any pair of async byte streams
pub struct FramedRelay<R, W> {
    reader: FramedRead<R, FrameCodec>,
    writer: FramedWrite<W, FrameCodec>,
}

impl<R, W> FramedRelay<R, W>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer: FramedWrite::new(writer, FrameCodec::new()),
        }
    }
}

#[async_trait]
impl<R, W> Relay for FramedRelay<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.writer.send(frame).await.map_err(into_network)
    }

    async fn receive(&mut self) -> Result<Option<Frame>> {
        self.reader.next().await.transpose().map_err(into_network)
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.close().await.map_err(into_network)
    }
}

/// Transport failures surface as network errors; framing errors keep their kind
fn into_network(err: PoolError) -> PoolError {
    match err {
        PoolError::Io(e) => PoolError::Network(e.to_string()),
        other => other,
    }
}

/// Starts worker processes and connects a relay to them
#[async_trait]
pub trait RelayFactory: Send + Sync {
    /// Spawn `command`, connect its relay and complete the pid handshake
    ///
    /// The returned worker is `Ready`. On failure the process is killed.
    async fn spawn_worker(&self, command: CommandSpec, events: Arc<EventBus>) -> Result<Worker>;
}

/// Pool side of the pid handshake
///
/// Returns the pid reported by the worker.
pub async fn fetch_pid(relay: &mut dyn Relay) -> Result<u32> {
    let hello = PidCommand {
        pid: std::process::id(),
    };
    relay.send(Frame::control(&hello)?).await?;

    let frame = relay.receive().await?.ok_or_else(|| {
        PoolError::Network("worker closed the relay during handshake".to_string())
    })?;

    let reply: PidCommand = frame.parse_control()?;
    Ok(reply.pid)
}
