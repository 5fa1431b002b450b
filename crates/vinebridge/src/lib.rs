//! Host-side shim for bridging Windows VST2 plugins into Linux hosts.
//!
//! This crate is loaded by the host as a plugin library. On load it spawns a
//! `vinebridge-runner` process under Wine that hosts the actual Windows
//! plugin, and forwards every plugin-API call over a set of Unix-socket
//! channels. The runner-side implementation is in `vinebridge-runner`.
//!
//! ## Architecture
//!
//! - **Crash isolation**: the Windows plugin runs in its own process
//! - **Mixed architectures**: 32-bit and 64-bit plugins select matching runners
//! - **Exact call semantics**: every forwarded call blocks for its response,
//!   preserving the synchronous contract of the plugin ABI

pub mod error;
pub use error::{BridgeError, Result};

pub mod protocol;
pub use protocol::{Event, EventPayload, EventResult, OPCODE_CLOSE};

pub mod descriptor;
pub use descriptor::{DescriptorInfo, HostCallbackProc, PluginDescriptor};

pub mod arch;
pub use arch::{detect_architecture, PluginArchitecture};

pub mod transport;
pub use transport::{BridgeSockets, ChannelId, EventChannel};

pub mod codec;
pub use codec::{DataConverter, DefaultDataConverter, PayloadRule, RuleConverter};

mod host;
pub use host::HostBridge;

mod registry;

pub mod paths;
