//! Runner process for vinebridge.
//!
//! This crate is the Wine side of the bridge: it loads the actual Windows
//! plugin, serves the host's forwarded calls over the bridge sockets, and
//! pumps the Win32 message loop the plugin expects to exist. It is spawned
//! by the `vinebridge` shim and is not meant to be run by hand.

pub mod event_loop;
pub mod loader;
pub mod session;
pub mod thread;

pub use event_loop::EventLoop;
pub use loader::LoadedPlugin;
pub use session::PluginBridge;
pub use thread::RunnerThread;
