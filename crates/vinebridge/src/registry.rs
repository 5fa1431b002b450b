//! Mapping from descriptor pointers back to their bridge sessions.
//!
//! The plugin ABI gives the host nothing but the descriptor pointer to pass
//! into calls, so the descriptor's opaque tag carries a key into a global
//! table of live sessions. Every exported function pointer is a trampoline
//! that resolves the session through that table; a stale descriptor after
//! close resolves to nothing and the call is answered with a default instead
//! of a crash.

use crate::descriptor::{HostCallbackProc, PluginDescriptor};
use crate::host::HostBridge;
use crate::protocol::OPCODE_CLOSE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

/// Environment variable naming the Windows plugin this shim stands in for.
pub const PLUGIN_ENV_VAR: &str = "VINEBRIDGE_PLUGIN";

static SESSIONS: OnceLock<Mutex<HashMap<isize, Arc<HostBridge>>>> = OnceLock::new();
// Tag 0 is reserved for "never registered".
static NEXT_TAG: AtomicIsize = AtomicIsize::new(1);

fn sessions() -> &'static Mutex<HashMap<isize, Arc<HostBridge>>> {
    SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Publish a session: allocate a tag, fill the descriptor's host-owned slots
/// and hand its pointer to the host.
fn register(bridge: HostBridge) -> *mut PluginDescriptor {
    let tag = NEXT_TAG.fetch_add(1, Ordering::SeqCst);
    let bridge = Arc::new(bridge);
    let descriptor = bridge.descriptor_ptr();

    // SAFETY: the descriptor has not been published yet; nothing else can
    // touch it until this function returns its pointer.
    unsafe {
        let descriptor = &mut *descriptor;
        descriptor.tag = tag;
        descriptor.dispatcher = Some(dispatch_trampoline);
        descriptor.process = Some(process_trampoline);
        descriptor.process_replacing = Some(process_replacing_trampoline);
        descriptor.set_parameter = Some(set_parameter_trampoline);
        descriptor.get_parameter = Some(get_parameter_trampoline);
    }

    sessions().lock().insert(tag, bridge);
    descriptor
}

/// Resolve the session owning a descriptor. `None` after close or for a
/// pointer that never came from this shim.
fn with_session<R>(descriptor: *mut PluginDescriptor, f: impl FnOnce(&HostBridge) -> R) -> Option<R> {
    if descriptor.is_null() {
        return None;
    }
    // SAFETY: hosts only pass back pointers they received from the entry
    // point; the tag read is the probe that validates the rest.
    let tag = unsafe { (*descriptor).tag };
    let session = sessions().lock().get(&tag).cloned();
    match session {
        Some(bridge) => Some(f(&bridge)),
        None => {
            warn!(tag, "call on unregistered plugin descriptor ignored");
            None
        }
    }
}

extern "C" fn dispatch_trampoline(
    descriptor: *mut PluginDescriptor,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> isize {
    let result =
        with_session(descriptor, |bridge| bridge.dispatch(opcode, index, value, data, option))
            .unwrap_or(0);
    if opcode == OPCODE_CLOSE && !descriptor.is_null() {
        // The session has shut itself down; dropping the table entry releases
        // the last reference.
        let tag = unsafe { (*descriptor).tag };
        sessions().lock().remove(&tag);
    }
    result
}

extern "C" fn process_trampoline(
    descriptor: *mut PluginDescriptor,
    inputs: *mut *mut f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    let _ = with_session(descriptor, |bridge| bridge.process(inputs, outputs, frames));
}

extern "C" fn process_replacing_trampoline(
    descriptor: *mut PluginDescriptor,
    inputs: *mut *mut f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    let _ = with_session(descriptor, |bridge| {
        bridge.process_replacing(inputs, outputs, frames)
    });
}

extern "C" fn set_parameter_trampoline(descriptor: *mut PluginDescriptor, index: i32, value: f32) {
    let _ = with_session(descriptor, |bridge| bridge.set_parameter(index, value));
}

extern "C" fn get_parameter_trampoline(descriptor: *mut PluginDescriptor, index: i32) -> f32 {
    with_session(descriptor, |bridge| bridge.get_parameter(index)).unwrap_or(0.0)
}

fn plugin_path_from_env() -> Option<PathBuf> {
    std::env::var_os(PLUGIN_ENV_VAR).map(PathBuf::from)
}

fn init_logging() {
    // The shim lives inside a host process that owns stdout; never panic
    // over an already-installed subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// The plugin entry point the host resolves after loading this library.
#[no_mangle]
pub extern "C" fn VSTPluginMain(host_callback: Option<HostCallbackProc>) -> *mut PluginDescriptor {
    init_logging();

    let Some(host_callback) = host_callback else {
        error!("host passed a null callback to the entry point");
        return std::ptr::null_mut();
    };
    let Some(plugin_path) = plugin_path_from_env() else {
        error!("{PLUGIN_ENV_VAR} is not set; cannot locate the Windows plugin");
        return std::ptr::null_mut();
    };

    match HostBridge::new(&plugin_path, host_callback) {
        Ok(bridge) => register(bridge),
        Err(e) => {
            error!(plugin = %plugin_path.display(), %e, "failed to start bridge session");
            std::ptr::null_mut()
        }
    }
}

/// Alias kept for hosts that resolve the pre-2.4 entry point name.
#[no_mangle]
pub extern "C" fn main_plugin(host_callback: Option<HostCallbackProc>) -> *mut PluginDescriptor {
    VSTPluginMain(host_callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorInfo;
    use crate::protocol::Event;
    use crate::transport::{BridgeSockets, EventChannel};
    use std::path::Path;
    use tokio::net::UnixStream;
    use tokio::runtime::Runtime;

    extern "C" fn noop_callback(
        _descriptor: *mut PluginDescriptor,
        _opcode: i32,
        _index: i32,
        _value: isize,
        _data: *mut c_void,
        _option: f32,
    ) -> isize {
        0
    }

    fn fake_session() -> HostBridge {
        let runtime = Runtime::new().unwrap();
        let (host_sockets, mut runner_sockets) = {
            let _guard = runtime.enter();
            let (dispatch_a, dispatch_b) = UnixStream::pair().unwrap();
            let (callback_a, callback_b) = UnixStream::pair().unwrap();
            let (descriptor_a, descriptor_b) = UnixStream::pair().unwrap();
            let (processor_a, processor_b) = UnixStream::pair().unwrap();
            (
                BridgeSockets {
                    dispatch: EventChannel::new(dispatch_a),
                    callback: EventChannel::new(callback_a),
                    descriptor: EventChannel::new(descriptor_a),
                    processor: EventChannel::new(processor_a),
                },
                BridgeSockets {
                    dispatch: EventChannel::new(dispatch_b),
                    callback: EventChannel::new(callback_b),
                    descriptor: EventChannel::new(descriptor_b),
                    processor: EventChannel::new(processor_b),
                },
            )
        };
        runtime.spawn(async move {
            let info = DescriptorInfo {
                num_programs: 0,
                num_params: 1,
                num_inputs: 2,
                num_outputs: 2,
                flags: 0,
                initial_delay: 0,
                unique_id: 1,
                version: 1,
            };
            runner_sockets.descriptor.send(&info).await.unwrap();
            let _ = runner_sockets.dispatch.recv::<Event>().await;
        });
        HostBridge::from_parts(runtime, host_sockets, None, noop_callback, Path::new("/tmp/x.dll"))
            .unwrap()
    }

    #[test]
    fn test_register_fills_host_owned_slots() {
        let descriptor = register(fake_session());
        let view = unsafe { &*descriptor };
        assert!(view.tag > 0);
        assert!(view.dispatcher.is_some());
        assert!(view.process_replacing.is_some());
        assert_eq!(view.num_inputs, 2);

        assert!(with_session(descriptor, |_| ()).is_some());

        // Cleanup through the public path.
        (view.dispatcher.unwrap())(descriptor, OPCODE_CLOSE, 0, 0, std::ptr::null_mut(), 0.0);
    }

    #[test]
    fn test_close_unregisters_the_session() {
        let descriptor = register(fake_session());
        // The descriptor's backing memory goes away with the session, so the
        // post-close check must use the captured tag, not the pointer.
        let (tag, dispatcher) = unsafe { ((*descriptor).tag, (*descriptor).dispatcher.unwrap()) };

        assert_eq!(dispatcher(descriptor, OPCODE_CLOSE, 0, 0, std::ptr::null_mut(), 0.0), 0);
        assert!(!sessions().lock().contains_key(&tag));
    }

    #[test]
    fn test_unregistered_descriptor_gets_defaults() {
        let mut orphan = PluginDescriptor::empty();
        let descriptor: *mut PluginDescriptor = &mut orphan;
        assert_eq!(dispatch_trampoline(descriptor, 10, 0, 0, std::ptr::null_mut(), 0.0), 0);
        assert_eq!(get_parameter_trampoline(descriptor, 0), 0.0);
        assert_eq!(dispatch_trampoline(std::ptr::null_mut(), 10, 0, 0, std::ptr::null_mut(), 0.0), 0);
    }

    #[test]
    fn test_tags_are_unique_per_registration() {
        let a = register(fake_session());
        let b = register(fake_session());
        let (tag_a, tag_b) = unsafe { ((*a).tag, (*b).tag) };
        assert_ne!(tag_a, tag_b);

        for descriptor in [a, b] {
            let dispatcher = unsafe { (*descriptor).dispatcher.unwrap() };
            dispatcher(descriptor, OPCODE_CLOSE, 0, 0, std::ptr::null_mut(), 0.0);
        }
    }
}
