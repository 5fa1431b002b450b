//! The runner side of a bridge session.
//!
//! Thread layout mirrors what a plugin gets from a real Windows host: one
//! thread owns loading, setup calls and the plugin's eventual close; a second
//! thread serves audio-rate traffic; the main thread pumps the message loop.

use crate::event_loop::EventLoop;
use crate::loader::LoadedPlugin;
use crate::thread::RunnerThread;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info};
use vinebridge::codec::{self, send_event, RuleConverter};
use vinebridge::protocol::{ProcessorRequest, ProcessorResponse};
use vinebridge::transport::BridgeSockets;
use vinebridge::{BridgeError, EventChannel, PluginDescriptor, Result};

/// Shared state behind the host-callback function pointer. Global because
/// the plugin ABI gives the callback no closure argument; a runner process
/// hosts exactly one plugin, so one slot is all there is.
struct CallbackProxy {
    handle: Handle,
    channel: Mutex<EventChannel>,
    converter: RuleConverter,
}

static CALLBACK_PROXY: OnceLock<CallbackProxy> = OnceLock::new();

/// The callback handed to the plugin's entry point. Forwards the call to the
/// real host and blocks for its answer. Always invoked on the plugin or
/// processor thread outside the runtime (the loops leave the runtime before
/// calling into the plugin), so blocking on the handle here is legal even
/// mid-dispatch.
extern "C" fn host_callback_proxy(
    _descriptor: *mut PluginDescriptor,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> isize {
    let Some(proxy) = CALLBACK_PROXY.get() else {
        error!(opcode, "host callback invoked before the proxy was installed");
        return 0;
    };
    let mut channel = proxy.channel.lock();
    match proxy.handle.block_on(send_event(
        &mut channel,
        &proxy.converter,
        opcode,
        index,
        value,
        data,
        option,
    )) {
        Ok(result) => result,
        Err(e) => {
            error!(opcode, %e, "host callback failed");
            0
        }
    }
}

/// What the processor loop needs from the plugin. A trait so the loop can be
/// exercised without loading a real Windows image.
pub trait ProcessorTarget: Send + Sync {
    fn set_parameter(&self, index: i32, value: f32);
    fn get_parameter(&self, index: i32) -> f32;
    fn process(&self, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>>;
    fn process_replacing(&self, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>>;
}

impl ProcessorTarget for LoadedPlugin {
    fn set_parameter(&self, index: i32, value: f32) {
        LoadedPlugin::set_parameter(self, index, value)
    }

    fn get_parameter(&self, index: i32) -> f32 {
        LoadedPlugin::get_parameter(self, index)
    }

    fn process(&self, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>> {
        LoadedPlugin::process(self, inputs, frames)
    }

    fn process_replacing(&self, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>> {
        LoadedPlugin::process_replacing(self, inputs, frames)
    }
}

/// Serve audio-thread requests until the channel closes.
///
/// Blocking on purpose: the target is foreign code that may call back into
/// the host (and so block on the runtime itself), which is only legal if
/// this thread is outside the runtime when the target runs.
pub fn processor_loop(
    handle: &Handle,
    channel: &mut EventChannel,
    target: &dyn ProcessorTarget,
) -> Result<()> {
    loop {
        let request: ProcessorRequest = handle.block_on(channel.recv())?;
        let response = match request {
            ProcessorRequest::Process { inputs, frames } => ProcessorResponse::Audio {
                outputs: target.process(&inputs, frames),
            },
            ProcessorRequest::ProcessReplacing { inputs, frames } => ProcessorResponse::Audio {
                outputs: target.process_replacing(&inputs, frames),
            },
            ProcessorRequest::SetParameter { index, value } => {
                target.set_parameter(index, value);
                ProcessorResponse::ParameterSet
            }
            ProcessorRequest::GetParameter { index } => ProcessorResponse::Parameter {
                value: target.get_parameter(index),
            },
        };
        handle.block_on(channel.send(&response))?;
    }
}

/// Serve forwarded dispatcher calls until the channel closes. Blocking for
/// the same reason as [`processor_loop`].
fn dispatch_loop(handle: &Handle, channel: &mut EventChannel, plugin: &LoadedPlugin) -> Result<()> {
    let mut call = |opcode, index, value, data: *mut c_void, option| {
        plugin.dispatch(opcode, index, value, data, option)
    };
    loop {
        codec::passthrough_event(handle, channel, &mut call)?;
    }
}

/// One runner session, from socket connect to plugin close.
pub struct PluginBridge;

impl PluginBridge {
    /// Connect to the shim, load the plugin and serve until the host hangs
    /// up. Blocks the calling thread for the lifetime of the session.
    pub fn run(plugin_path: &Path, socket_path: &Path) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;

        info!(
            plugin = %plugin_path.display(),
            socket = %socket_path.display(),
            "connecting to host shim"
        );
        let BridgeSockets {
            dispatch,
            callback,
            descriptor,
            processor,
        } = runtime.block_on(BridgeSockets::connect_all(socket_path))?;

        // The proxy must exist before the entry point runs: plugins call the
        // host during their own initialization.
        CALLBACK_PROXY
            .set(CallbackProxy {
                handle: runtime.handle().clone(),
                channel: Mutex::new(callback),
                converter: RuleConverter::host_callback(),
            })
            .map_err(|_| BridgeError::Handshake("callback proxy already installed".to_string()))?;

        let shutdown = Arc::new(watch::channel(false).0);
        let shutdown_rx = shutdown.subscribe();

        let (plugin_tx, plugin_rx) = std::sync::mpsc::channel::<Result<Arc<LoadedPlugin>>>();
        let plugin_thread = {
            let handle = runtime.handle().clone();
            let shutdown = Arc::clone(&shutdown);
            let plugin_path = plugin_path.to_path_buf();
            let mut dispatch = dispatch;
            let mut descriptor = descriptor;
            RunnerThread::spawn("plugin", move || {
                let plugin = match LoadedPlugin::load(&plugin_path, host_callback_proxy) {
                    Ok(plugin) => Arc::new(plugin),
                    Err(e) => {
                        let _ = plugin_tx.send(Err(e));
                        let _ = shutdown.send(true);
                        return;
                    }
                };
                if let Err(e) = handle.block_on(descriptor.send(&plugin.descriptor_info())) {
                    error!(%e, "descriptor transfer failed");
                    let _ = shutdown.send(true);
                    return;
                }
                let _ = plugin_tx.send(Ok(Arc::clone(&plugin)));

                match dispatch_loop(&handle, &mut dispatch, &plugin) {
                    Err(BridgeError::ChannelClosed) => debug!("dispatch channel closed by host"),
                    Err(e) => error!(%e, "dispatch loop failed"),
                    Ok(()) => {}
                }
                // The shim never forwards the close opcode; the hangup above
                // is the close signal, and the plugin is closed here on the
                // same thread that loaded it.
                plugin.close();
                let _ = shutdown.send(true);
            })?
        };

        let plugin = match plugin_rx.recv() {
            Ok(Ok(plugin)) => plugin,
            Ok(Err(e)) => {
                drop(plugin_thread);
                return Err(e);
            }
            Err(_) => {
                drop(plugin_thread);
                return Err(BridgeError::Handshake(
                    "plugin thread exited before reporting a descriptor".to_string(),
                ));
            }
        };
        info!("plugin loaded, serving");

        let processor_thread = {
            let handle = runtime.handle().clone();
            let shutdown = Arc::clone(&shutdown);
            let mut processor = processor;
            RunnerThread::spawn("processor", move || {
                match processor_loop(&handle, &mut processor, plugin.as_ref()) {
                    Err(BridgeError::ChannelClosed) => debug!("processor channel closed by host"),
                    Err(e) => error!(%e, "processor loop failed"),
                    Ok(()) => {}
                }
                let _ = shutdown.send(true);
            })?
        };

        runtime.block_on(EventLoop::default().run(shutdown_rx, crate::event_loop::pump_messages));
        info!("session over, shutting down");

        // Dropping joins; the loops have already observed the hangup.
        drop(processor_thread);
        drop(plugin_thread);
        Ok(())
    }
}
