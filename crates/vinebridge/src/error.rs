//! Error types for the plugin bridge

use crate::transport::ChannelId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("'{path}' is not a valid Windows plugin image: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    #[error("'{path}' targets an unsupported architecture: machine type {machine:#06x}")]
    UnsupportedArchitecture { path: PathBuf, machine: u16 },

    #[error("plugin image not found: {0}")]
    PluginNotFound(PathBuf),

    #[error("could not locate the runner binary '{name}'")]
    RunnerNotFound { name: String },

    #[error("no Wine prefix found for '{0}' and WINEPREFIX is not set")]
    PrefixNotFound(PathBuf),

    #[error("failed to load plugin '{path}': {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel greeting mismatch: expected {expected:?}, got {actual:?}")]
    ChannelMismatch {
        expected: ChannelId,
        actual: ChannelId,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed by peer")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
