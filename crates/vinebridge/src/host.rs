//! Host-side bridge session: one Wine runner process per plugin instance.

use crate::codec::{send_event, RuleConverter};
use crate::descriptor::{DescriptorInfo, HostCallbackProc, PluginDescriptor};
use crate::error::{BridgeError, Result};
use crate::paths;
use crate::protocol::{ProcessorRequest, ProcessorResponse, OPCODE_CLOSE};
use crate::transport::{self, BridgeSockets, EventChannel};
use crate::{arch, codec};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, warn};

/// How long a runner gets to exit on its own after its sockets close before
/// it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// How often the handshake checks whether the runner died under it.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A live bridge session.
///
/// Owns the runner process, the socket channels to it, and the descriptor
/// handed back to the host. Construction blocks until the runner has loaded
/// the plugin and reported its descriptor; after that every plugin-API call
/// is forwarded synchronously over the matching channel.
pub struct HostBridge {
    runtime: Runtime,
    plugin_path: PathBuf,
    dispatch: Mutex<Option<EventChannel>>,
    processor: Mutex<Option<EventChannel>>,
    callback_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    runner: Mutex<Option<Child>>,
    converter: RuleConverter,
    closed: AtomicBool,
    // Boxed so the address the host sees stays stable for the lifetime of
    // the session, written through an UnsafeCell because the one write
    // happens after the callback loop is already running.
    descriptor: Box<UnsafeCell<PluginDescriptor>>,
}

// SAFETY: the descriptor cell is written exactly once, inside from_parts,
// before the publication flag is set with Release ordering. The callback
// thread hands the host a null pointer until it observes the flag (Acquire),
// so no reader can see the write in progress; all later access through
// descriptor_ptr is read-only. Every other field is synchronized by its own
// lock or atomic.
unsafe impl Send for HostBridge {}
unsafe impl Sync for HostBridge {}

impl HostBridge {
    /// Spawn a runner for the plugin and perform the full handshake.
    pub fn new(plugin_path: &Path, host_callback: HostCallbackProc) -> Result<Self> {
        let architecture = arch::detect_architecture(plugin_path)?;
        let runner_binary = paths::find_runner(architecture)?;
        let wine_prefix = paths::find_wine_prefix(plugin_path)?;
        let plugin_name = paths::plugin_base_name(plugin_path);
        let socket_path = transport::generate_endpoint(&plugin_name)?;

        info!(
            plugin = %plugin_path.display(),
            ?architecture,
            prefix = %wine_prefix.display(),
            socket = %socket_path.display(),
            "starting bridge session"
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;

        // Bind before spawning so the runner never races a missing endpoint.
        let listener = {
            let _guard = runtime.enter();
            transport::bind_endpoint(&socket_path)?
        };

        let mut child = Command::new("wine")
            .arg(&runner_binary)
            .arg(plugin_path)
            .arg(&socket_path)
            .env("WINEPREFIX", &wine_prefix)
            .spawn()?;

        let sockets = match runtime.block_on(race_child_exit(
            &mut child,
            BridgeSockets::accept_all(&listener),
        )) {
            Ok(sockets) => sockets,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        // All channels are up; the socket file has no further use.
        let _ = std::fs::remove_file(&socket_path);

        Self::from_parts(runtime, sockets, Some(child), host_callback, plugin_path)
    }

    /// Assemble a session from already-connected channels.
    ///
    /// Starts the callback loop, then blocks for the descriptor transfer. The
    /// ordering matters: plugins may call back into the host while still
    /// inside their own initialization, before they report a descriptor.
    pub(crate) fn from_parts(
        runtime: Runtime,
        sockets: BridgeSockets,
        mut runner: Option<Child>,
        host_callback: HostCallbackProc,
        plugin_path: &Path,
    ) -> Result<Self> {
        let BridgeSockets {
            dispatch,
            callback,
            mut descriptor,
            processor,
        } = sockets;

        let descriptor_cell = Box::new(UnsafeCell::new(PluginDescriptor::empty()));
        let descriptor_ptr = SendPtr(descriptor_cell.get());
        let published = Arc::new(AtomicBool::new(false));

        // The callback loop runs on its own thread rather than a runtime
        // task: it invokes the host's callback, and the host may re-enter
        // dispatch from inside it. Blocking on the runtime is only legal if
        // the invoking thread is not a runtime worker.
        let callback_thread = std::thread::Builder::new()
            .name("vinebridge-callback".to_string())
            .spawn({
                let handle = runtime.handle().clone();
                let published = Arc::clone(&published);
                move || callback_loop(handle, callback, host_callback, descriptor_ptr, published)
            })?;

        let transfer: Result<DescriptorInfo> = runtime.block_on(async {
            match runner.as_mut() {
                Some(child) => race_child_exit(child, descriptor.recv()).await,
                None => descriptor.recv().await,
            }
        });
        let info = match transfer {
            Ok(info) => info,
            Err(e) => {
                if let Some(mut child) = runner {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                let _ = callback_thread.join();
                return Err(e);
            }
        };
        debug!(unique_id = info.unique_id, num_params = info.num_params, "received plugin descriptor");

        // SAFETY: the only write to the cell. The host has not seen the
        // pointer yet, and the callback thread hands out null until the
        // publication flag below is set.
        info.apply(unsafe { &mut *descriptor_cell.get() });
        published.store(true, Ordering::Release);

        Ok(Self {
            runtime,
            plugin_path: plugin_path.to_path_buf(),
            dispatch: Mutex::new(Some(dispatch)),
            processor: Mutex::new(Some(processor)),
            callback_thread: Mutex::new(Some(callback_thread)),
            runner: Mutex::new(runner),
            converter: RuleConverter::dispatch(),
            closed: AtomicBool::new(false),
            descriptor: descriptor_cell,
        })
    }

    /// The stable descriptor pointer handed back to the host. The registry
    /// fills in the function-pointer slots and the tag before publishing it.
    pub(crate) fn descriptor_ptr(&self) -> *mut PluginDescriptor {
        self.descriptor.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forward one dispatcher call to the plugin and block for its result.
    ///
    /// The close opcode is never forwarded: the runner observes the sockets
    /// closing and runs the plugin's close locally, which keeps teardown
    /// working even when the runner has already crashed.
    pub fn dispatch(&self, opcode: i32, index: i32, value: isize, data: *mut c_void, option: f32) -> isize {
        if opcode == OPCODE_CLOSE {
            self.close();
            return 0;
        }
        if self.is_closed() {
            warn!(opcode, "dispatch on closed session ignored");
            return 0;
        }

        let mut guard = self.dispatch.lock();
        let Some(channel) = guard.as_mut() else {
            return 0;
        };
        match self.runtime.block_on(send_event(
            channel,
            &self.converter,
            opcode,
            index,
            value,
            data,
            option,
        )) {
            Ok(result) => result,
            Err(e) => {
                error!(opcode, %e, "dispatch failed");
                0
            }
        }
    }

    pub fn process(&self, inputs: *mut *mut f32, outputs: *mut *mut f32, frames: i32) {
        let request = ProcessorRequest::Process {
            inputs: self.collect_inputs(inputs, frames),
            frames,
        };
        if let Some(ProcessorResponse::Audio { outputs: rendered }) = self.run_processor(request) {
            // The accumulating variant adds into the host's buffers.
            write_outputs(outputs, &rendered, frames, true);
        }
    }

    pub fn process_replacing(&self, inputs: *mut *mut f32, outputs: *mut *mut f32, frames: i32) {
        let request = ProcessorRequest::ProcessReplacing {
            inputs: self.collect_inputs(inputs, frames),
            frames,
        };
        if let Some(ProcessorResponse::Audio { outputs: rendered }) = self.run_processor(request) {
            write_outputs(outputs, &rendered, frames, false);
        }
    }

    pub fn set_parameter(&self, index: i32, value: f32) {
        let _ = self.run_processor(ProcessorRequest::SetParameter { index, value });
    }

    pub fn get_parameter(&self, index: i32) -> f32 {
        match self.run_processor(ProcessorRequest::GetParameter { index }) {
            Some(ProcessorResponse::Parameter { value }) => value,
            _ => 0.0,
        }
    }

    fn run_processor(&self, request: ProcessorRequest) -> Option<ProcessorResponse> {
        if self.is_closed() {
            return None;
        }
        let mut guard = self.processor.lock();
        let channel = guard.as_mut()?;
        let result = self.runtime.block_on(async {
            channel.send(&request).await?;
            channel.recv::<ProcessorResponse>().await
        });
        match result {
            Ok(response) => Some(response),
            Err(e) => {
                error!(%e, "processor request failed");
                None
            }
        }
    }

    fn collect_inputs(&self, inputs: *mut *mut f32, frames: i32) -> Vec<Vec<f32>> {
        // SAFETY: read-only access to the descriptor after construction.
        let num_inputs = unsafe { (*self.descriptor.get()).num_inputs }.max(0) as usize;
        if inputs.is_null() || frames <= 0 {
            return vec![Vec::new(); num_inputs];
        }
        let frames = frames as usize;
        (0..num_inputs)
            .map(|channel| {
                // SAFETY: the host guarantees num_inputs valid channel
                // pointers of at least `frames` samples each.
                let ptr = unsafe { *inputs.add(channel) };
                if ptr.is_null() {
                    vec![0.0; frames]
                } else {
                    unsafe { std::slice::from_raw_parts(ptr, frames) }.to_vec()
                }
            })
            .collect()
    }

    /// Tear the session down: drop the channels so the runner sees hangup,
    /// give it a grace period to close the plugin and exit, then kill it.
    /// Idempotent; every call after the first is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(plugin = %self.plugin_path.display(), "closing bridge session");

        *self.dispatch.lock() = None;
        *self.processor.lock() = None;
        self.reap_runner();

        // With the runner gone its callback end is closed, so the loop has
        // observed the hangup.
        if let Some(thread) = self.callback_thread.lock().take() {
            // A host callback can itself trigger close; a thread cannot
            // join itself.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }

    fn reap_runner(&self) {
        let Some(mut child) = self.runner.lock().take() else {
            return;
        };
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "runner exited");
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%e, "could not poll runner");
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        warn!("runner did not exit within grace period, killing it");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for HostBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Raw descriptor pointer moved into the callback thread.
struct SendPtr(*mut PluginDescriptor);

// SAFETY: the pointee outlives the callback thread (close() joins the thread
// before the owning HostBridge is dropped) and the thread only passes the
// pointer through to the host callback.
unsafe impl Send for SendPtr {}

impl SendPtr {
    // Accessor rather than field access: a closure touching only `.0` would
    // capture the bare raw pointer and lose the wrapper's Send.
    fn get(&self) -> *mut PluginDescriptor {
        self.0
    }
}

/// Serve plugin-to-host callbacks for the whole session, from before the
/// descriptor transfer until the channel closes. Runs on a dedicated thread;
/// the host callback may re-enter the bridge, so it must not execute on a
/// runtime worker.
fn callback_loop(
    handle: Handle,
    mut channel: EventChannel,
    host_callback: HostCallbackProc,
    descriptor: SendPtr,
    published: Arc<AtomicBool>,
) {
    let mut call = move |opcode, index, value, data: *mut c_void, option| {
        // Until the descriptor is published the host gets a null pointer,
        // exactly what plugins pass when calling out of their own entry
        // point. The half-written struct is never handed out.
        let descriptor = if published.load(Ordering::Acquire) {
            descriptor.get()
        } else {
            std::ptr::null_mut()
        };
        host_callback(descriptor, opcode, index, value, data, option)
    };
    loop {
        match codec::passthrough_event(&handle, &mut channel, &mut call) {
            Ok(()) => {}
            Err(BridgeError::ChannelClosed) => {
                debug!("callback channel closed");
                return;
            }
            Err(e) => {
                error!(%e, "callback loop failed");
                return;
            }
        }
    }
}

/// Add or copy rendered channels back into the host's output pointers.
fn write_outputs(outputs: *mut *mut f32, rendered: &[Vec<f32>], frames: i32, accumulate: bool) {
    if outputs.is_null() || frames <= 0 {
        return;
    }
    let frames = frames as usize;
    for (channel, samples) in rendered.iter().enumerate() {
        // SAFETY: the host provides one valid pointer per output channel the
        // plugin declared, each at least `frames` samples long.
        let ptr = unsafe { *outputs.add(channel) };
        if ptr.is_null() {
            continue;
        }
        let out = unsafe { std::slice::from_raw_parts_mut(ptr, frames) };
        let n = frames.min(samples.len());
        if accumulate {
            for (dst, src) in out[..n].iter_mut().zip(&samples[..n]) {
                *dst += src;
            }
        } else {
            out[..n].copy_from_slice(&samples[..n]);
        }
    }
}

/// Run a handshake step while watching for the runner dying under it, so a
/// crashed runner fails construction instead of hanging the host forever.
async fn race_child_exit<T>(
    child: &mut Child,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::pin!(step);
    loop {
        tokio::select! {
            result = &mut step => return result,
            _ = tokio::time::sleep(CHILD_POLL_INTERVAL) => {
                if let Some(status) = child.try_wait()? {
                    return Err(BridgeError::Handshake(format!(
                        "runner exited during handshake: {status}"
                    )));
                }
            }
        }
    }
}
