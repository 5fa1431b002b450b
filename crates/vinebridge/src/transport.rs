//! Socket transport between the host shim and the runner process.
//!
//! Each call category gets its own Unix-socket channel. All channels are
//! accepted and connected in one fixed order on both sides; a greeting frame
//! carrying the [`ChannelId`] turns any ordering mistake into a clean
//! handshake failure instead of silently cross-wired channels.

use crate::error::{BridgeError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Subdirectory of the system temp dir holding all bridge endpoints.
const SOCKET_DIR: &str = "vinebridge";

/// Frames larger than this are treated as protocol corruption rather than
/// allocated blindly.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Identity of one socket channel. Sent as the greeting frame on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelId {
    /// Host-to-plugin dispatch calls (GUI/setup thread).
    Dispatch,
    /// Plugin-to-host callbacks; read continuously by the host.
    Callback,
    /// One-shot descriptor transfer, runner to host.
    Descriptor,
    /// Audio-thread traffic: process calls and parameter access.
    Processor,
}

/// The connection order both sides must follow. The acceptor verifies each
/// greeting against this sequence.
pub const CHANNEL_ORDER: [ChannelId; 4] = [
    ChannelId::Dispatch,
    ChannelId::Callback,
    ChannelId::Descriptor,
    ChannelId::Processor,
];

/// One connected channel: an order-preserving byte stream carrying
/// length-prefixed bincode frames. Every channel has exactly one designated
/// reader; concurrent reads from two threads are a protocol violation.
pub struct EventChannel {
    stream: UnixStream,
}

impl EventChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Write one frame: u32 length prefix, then the bincode body.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let data = bincode::serialize(msg)?;
        self.stream.write_u32(data.len() as u32).await?;
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Read one frame. A peer hangup surfaces as [`BridgeError::ChannelClosed`],
    /// an oversized or undecodable frame as a protocol error.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = self.stream.read_u32().await.map_err(map_closed)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(BridgeError::Protocol(format!(
                "frame length {len} exceeds maximum"
            )));
        }
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data).await.map_err(map_closed)?;
        bincode::deserialize(&data)
            .map_err(|e| BridgeError::Protocol(format!("undecodable frame: {e}")))
    }
}

fn map_closed(e: std::io::Error) -> BridgeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BridgeError::ChannelClosed
    } else {
        BridgeError::Io(e)
    }
}

/// All channels of one bridge session, after the ordered handshake.
pub struct BridgeSockets {
    pub dispatch: EventChannel,
    pub callback: EventChannel,
    pub descriptor: EventChannel,
    pub processor: EventChannel,
}

impl BridgeSockets {
    /// Host side: accept all channels in [`CHANNEL_ORDER`], verifying each
    /// greeting. Any mismatch aborts the handshake.
    pub async fn accept_all(listener: &UnixListener) -> Result<Self> {
        Ok(Self {
            dispatch: accept_one(listener, ChannelId::Dispatch).await?,
            callback: accept_one(listener, ChannelId::Callback).await?,
            descriptor: accept_one(listener, ChannelId::Descriptor).await?,
            processor: accept_one(listener, ChannelId::Processor).await?,
        })
    }

    /// Runner side: connect all channels in [`CHANNEL_ORDER`], announcing each
    /// with its greeting frame.
    pub async fn connect_all(socket_path: &Path) -> Result<Self> {
        Ok(Self {
            dispatch: connect_one(socket_path, ChannelId::Dispatch).await?,
            callback: connect_one(socket_path, ChannelId::Callback).await?,
            descriptor: connect_one(socket_path, ChannelId::Descriptor).await?,
            processor: connect_one(socket_path, ChannelId::Processor).await?,
        })
    }
}

async fn accept_one(listener: &UnixListener, expected: ChannelId) -> Result<EventChannel> {
    let (stream, _) = listener.accept().await?;
    let mut channel = EventChannel::new(stream);
    let actual: ChannelId = channel.recv().await?;
    if actual != expected {
        return Err(BridgeError::ChannelMismatch { expected, actual });
    }
    Ok(channel)
}

async fn connect_one(socket_path: &Path, id: ChannelId) -> Result<EventChannel> {
    let stream = UnixStream::connect(socket_path).await?;
    let mut channel = EventChannel::new(stream);
    channel.send(&id).await?;
    Ok(channel)
}

/// Bind the listening endpoint, removing any stale socket file first.
pub fn bind_endpoint(socket_path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(socket_path);
    Ok(UnixListener::bind(socket_path)?)
}

/// Generate a fresh endpoint path under the bridge's temp subdirectory:
/// `<tmp>/vinebridge/<plugin>-<8 random alphanumeric>.sock`. Existence-checked
/// so concurrent bridge instances for the same plugin never collide.
pub fn generate_endpoint(plugin_name: &str) -> Result<PathBuf> {
    generate_endpoint_in(plugin_name, &std::env::temp_dir(), &mut rand::thread_rng())
}

pub fn generate_endpoint_in(
    plugin_name: &str,
    base_dir: &Path,
    rng: &mut impl Rng,
) -> Result<PathBuf> {
    let dir = base_dir.join(SOCKET_DIR);
    std::fs::create_dir_all(&dir)?;

    loop {
        let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
            .take(8)
            .map(char::from)
            .collect();
        let candidate = dir.join(format!("{plugin_name}-{suffix}.sock"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
}
