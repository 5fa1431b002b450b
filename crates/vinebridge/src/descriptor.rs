//! The plugin descriptor struct shared with the host over the plugin ABI.

use serde::{Deserialize, Serialize};
use std::ffi::c_void;

/// `b"VstP"` as a little-endian i32, the magic the host checks first.
pub const DESCRIPTOR_MAGIC: i32 = i32::from_le_bytes(*b"VstP");

pub type DispatcherProc =
    extern "C" fn(*mut PluginDescriptor, i32, i32, isize, *mut c_void, f32) -> isize;
pub type ProcessProc = extern "C" fn(*mut PluginDescriptor, *mut *mut f32, *mut *mut f32, i32);
pub type SetParameterProc = extern "C" fn(*mut PluginDescriptor, i32, f32);
pub type GetParameterProc = extern "C" fn(*mut PluginDescriptor, i32) -> f32;

/// The callback the host hands to the plugin entry point so the plugin can
/// call back into the host.
pub type HostCallbackProc =
    extern "C" fn(*mut PluginDescriptor, i32, i32, isize, *mut c_void, f32) -> isize;

/// The plugin's self-description as defined by the plugin ABI: a fixed-size
/// record of function-pointer slots and capability fields, returned to the
/// host from the plugin entry point.
///
/// Created empty at session construction and filled exactly once from the
/// runner's [`DescriptorInfo`]; read-only afterwards. The `tag` slot is opaque
/// to the ABI and carries the key that recovers the owning session from a
/// bare descriptor pointer.
#[repr(C)]
pub struct PluginDescriptor {
    pub magic: i32,
    pub dispatcher: Option<DispatcherProc>,
    pub process: Option<ProcessProc>,
    pub set_parameter: Option<SetParameterProc>,
    pub get_parameter: Option<GetParameterProc>,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    /// Opaque per-instance tag; never interpreted by the ABI itself.
    pub tag: isize,
    pub reserved: isize,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
    pub process_replacing: Option<ProcessProc>,
}

impl PluginDescriptor {
    /// A descriptor with no function pointers and zeroed capability fields.
    pub fn empty() -> Self {
        Self {
            magic: DESCRIPTOR_MAGIC,
            dispatcher: None,
            process: None,
            set_parameter: None,
            get_parameter: None,
            num_programs: 0,
            num_params: 0,
            num_inputs: 0,
            num_outputs: 0,
            flags: 0,
            tag: 0,
            reserved: 0,
            initial_delay: 0,
            unique_id: 0,
            version: 0,
            process_replacing: None,
        }
    }
}

/// The serializable subset of [`PluginDescriptor`]: everything except the
/// function pointers and the opaque tag, which are meaningless across the
/// process boundary. Sent exactly once over the descriptor channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorInfo {
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

impl DescriptorInfo {
    /// Snapshot the transferable fields of a loaded plugin's descriptor.
    pub fn capture(descriptor: &PluginDescriptor) -> Self {
        Self {
            num_programs: descriptor.num_programs,
            num_params: descriptor.num_params,
            num_inputs: descriptor.num_inputs,
            num_outputs: descriptor.num_outputs,
            flags: descriptor.flags,
            initial_delay: descriptor.initial_delay,
            unique_id: descriptor.unique_id,
            version: descriptor.version,
        }
    }

    /// Copy the transferred fields into the host-side descriptor. Function
    /// pointers and the tag are the host's own and are left untouched.
    pub fn apply(&self, descriptor: &mut PluginDescriptor) {
        descriptor.num_programs = self.num_programs;
        descriptor.num_params = self.num_params;
        descriptor.num_inputs = self.num_inputs;
        descriptor.num_outputs = self.num_outputs;
        descriptor.flags = self.flags;
        descriptor.initial_delay = self.initial_delay;
        descriptor.unique_id = self.unique_id;
        descriptor.version = self.version;
    }
}
