//! Loading the Windows plugin and talking to its descriptor.

use libloading::Library;
use std::ffi::c_void;
use std::path::Path;
use tracing::debug;
use vinebridge::descriptor::{ProcessProc, DESCRIPTOR_MAGIC};
use vinebridge::protocol::OPCODE_CLOSE;
use vinebridge::{BridgeError, DescriptorInfo, HostCallbackProc, PluginDescriptor, Result};

type EntryPoint = unsafe extern "C" fn(Option<HostCallbackProc>) -> *mut PluginDescriptor;

/// The loaded Windows plugin: its library handle plus the descriptor it
/// returned from the entry point.
///
/// The descriptor is owned by the plugin itself and stays valid until the
/// close opcode is dispatched; the library must outlive every call through
/// the descriptor's function pointers.
pub struct LoadedPlugin {
    descriptor: *mut PluginDescriptor,
    _library: Library,
}

// SAFETY: the plugin ABI expects exactly this sharing pattern, setup and GUI
// opcodes from one thread and audio calls from another. The bridge never
// issues concurrent calls on the same category.
unsafe impl Send for LoadedPlugin {}
unsafe impl Sync for LoadedPlugin {}

impl LoadedPlugin {
    /// Load the plugin image and run its entry point with our host callback.
    pub fn load(plugin_path: &Path, host_callback: HostCallbackProc) -> Result<Self> {
        let load_failed = |reason: String| BridgeError::LoadFailed {
            path: plugin_path.to_path_buf(),
            reason,
        };

        // SAFETY: running foreign library initializers is the entire point
        // of this process; nothing here can make that sound.
        let library = unsafe { Library::new(plugin_path) }
            .map_err(|e| load_failed(format!("could not load image: {e}")))?;

        // VSTPluginMain is the modern name; old plugins export main_plugin
        // or plain main.
        let entry: libloading::Symbol<EntryPoint> = unsafe {
            library
                .get(b"VSTPluginMain")
                .or_else(|_| library.get(b"main_plugin"))
                .or_else(|_| library.get(b"main"))
        }
        .map_err(|e| load_failed(format!("no plugin entry point: {e}")))?;

        debug!(plugin = %plugin_path.display(), "running plugin entry point");
        let descriptor = unsafe { entry(Some(host_callback)) };
        if descriptor.is_null() {
            return Err(load_failed("entry point returned null".to_string()));
        }
        if unsafe { (*descriptor).magic } != DESCRIPTOR_MAGIC {
            return Err(load_failed("descriptor has a bad magic value".to_string()));
        }

        Ok(Self {
            descriptor,
            _library: library,
        })
    }

    pub fn descriptor_info(&self) -> DescriptorInfo {
        // SAFETY: valid until close is dispatched.
        DescriptorInfo::capture(unsafe { &*self.descriptor })
    }

    pub fn dispatch(&self, opcode: i32, index: i32, value: isize, data: *mut c_void, option: f32) -> isize {
        // SAFETY: forwarding a call the host made with the same arguments.
        match unsafe { (*self.descriptor).dispatcher } {
            Some(dispatcher) => dispatcher(self.descriptor, opcode, index, value, data, option),
            None => 0,
        }
    }

    /// Dispatch the close opcode. The plugin frees its descriptor here, so
    /// this must be the last call that ever touches it.
    pub fn close(&self) {
        self.dispatch(OPCODE_CLOSE, 0, 0, std::ptr::null_mut(), 0.0);
    }

    pub fn set_parameter(&self, index: i32, value: f32) {
        if let Some(set_parameter) = unsafe { (*self.descriptor).set_parameter } {
            set_parameter(self.descriptor, index, value);
        }
    }

    pub fn get_parameter(&self, index: i32) -> f32 {
        match unsafe { (*self.descriptor).get_parameter } {
            Some(get_parameter) => get_parameter(self.descriptor, index),
            None => 0.0,
        }
    }

    pub fn process(&self, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>> {
        match unsafe { (*self.descriptor).process } {
            Some(process) => self.run_process(process, inputs, frames),
            None => Vec::new(),
        }
    }

    pub fn process_replacing(&self, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>> {
        match unsafe { (*self.descriptor).process_replacing } {
            Some(process) => self.run_process(process, inputs, frames),
            None => Vec::new(),
        }
    }

    /// Rebuild the pointer-array calling convention around owned buffers.
    /// Output buffers start zeroed, so the accumulating process variant
    /// produces its plain result here; the host side decides whether to add
    /// or copy.
    fn run_process(&self, process: ProcessProc, inputs: &[Vec<f32>], frames: i32) -> Vec<Vec<f32>> {
        let frame_count = frames.max(0) as usize;
        let num_outputs = unsafe { (*self.descriptor).num_outputs }.max(0) as usize;

        let mut input_ptrs: Vec<*mut f32> = inputs
            .iter()
            .map(|channel| channel.as_ptr() as *mut f32)
            .collect();
        let mut outputs = vec![vec![0.0f32; frame_count]; num_outputs];
        let mut output_ptrs: Vec<*mut f32> = outputs
            .iter_mut()
            .map(|channel| channel.as_mut_ptr())
            .collect();

        // Both pointer arrays stay alive across the call and every channel
        // buffer holds `frames` samples.
        process(
            self.descriptor,
            input_ptrs.as_mut_ptr(),
            output_ptrs.as_mut_ptr(),
            frames,
        );
        outputs
    }
}
