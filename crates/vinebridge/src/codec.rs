//! Event serialization and the pointer-classification policy.
//!
//! The plugin ABI passes an untyped `data` pointer whose meaning depends on
//! the opcode. A [`DataConverter`] classifies that pointer into an
//! [`EventPayload`] before a call crosses the socket, and writes any returned
//! payload back into the caller's buffer afterwards. [`send_event`] is the
//! forwarding half; [`passthrough_event`] is the receiving half that
//! reconstructs native arguments and invokes the real entry point.

use crate::error::Result;
use crate::protocol::{Event, EventPayload, EventResult, MAX_STRING_LENGTH};
use crate::transport::EventChannel;
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use tokio::runtime::Handle;

/// Per-opcode override of the default pointer classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    /// The opcode never carries payload. Needed where `value` is a numeric
    /// handle that can alias a valid-looking pointer.
    Forbid,
    /// The opcode always carries a raw buffer of this size, with the same
    /// amount of writable capacity for the response.
    Buffer(usize),
}

/// Classification and write-back policy, applied per opcode on both sides of
/// the bridge with opposite roles: the sender classifies, the receiver of the
/// response writes back.
pub trait DataConverter: Send + Sync {
    /// Classify the native data pointer for this call.
    fn read(&self, opcode: i32, index: i32, value: isize, data: *const c_void) -> EventPayload;

    /// Write a response payload back into the caller's buffer. `data` is the
    /// original non-null pointer the caller passed.
    fn write(&self, opcode: i32, data: *mut c_void, response: &EventResult);

    /// Map the peer's integer return onto the value handed back to the caller.
    fn return_value(&self, opcode: i32, original: isize) -> isize {
        let _ = opcode;
        original
    }
}

/// The fallback policy that works for almost every opcode.
///
/// Plugins are not required to zero their buffers before a call, so a leading
/// zero byte is indistinguishable from uninitialized memory. Classifying it as
/// an empty string would silently corrupt legitimate empty-string returns;
/// the `WantsString` sentinel keeps the two cases apart.
#[derive(Debug, Default)]
pub struct DefaultDataConverter;

impl DataConverter for DefaultDataConverter {
    fn read(&self, _opcode: i32, _index: i32, _value: isize, data: *const c_void) -> EventPayload {
        classify_pointer(data)
    }

    fn write(&self, _opcode: i32, data: *mut c_void, response: &EventResult) {
        if let EventPayload::Str(bytes) = &response.payload {
            // The destination buffer being large enough is the caller's
            // contract, inherited from the plugin ABI.
            unsafe { write_c_string(data, bytes) }
        }
    }
}

pub(crate) fn classify_pointer(data: *const c_void) -> EventPayload {
    if data.is_null() {
        return EventPayload::None;
    }
    let first = unsafe { *(data as *const u8) };
    if first == 0 {
        return EventPayload::WantsString;
    }
    // Raw bytes, no encoding assumed: plugins emit locale-encoded text.
    let s = unsafe { CStr::from_ptr(data as *const std::os::raw::c_char) };
    EventPayload::Str(s.to_bytes().to_vec())
}

/// Copy the string bytes plus a terminating NUL into `data`.
unsafe fn write_c_string(data: *mut c_void, bytes: &[u8]) {
    let out = data as *mut u8;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
    *out.add(bytes.len()) = 0;
}

/// [`DefaultDataConverter`] extended with a per-opcode rule table. Used as
/// the dispatch converter on the host side and the host-callback converter on
/// the runner side; the tables differ, the mechanism does not.
#[derive(Debug, Default)]
pub struct RuleConverter {
    rules: HashMap<i32, PayloadRule>,
    fallback: DefaultDataConverter,
}

impl RuleConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, opcode: i32, rule: PayloadRule) -> Self {
        self.rules.insert(opcode, rule);
        self
    }

    /// Converter for host-to-plugin dispatch calls.
    pub fn dispatch() -> Self {
        Self::new()
    }

    /// Converter for plugin-to-host callbacks.
    pub fn host_callback() -> Self {
        Self::new()
    }
}

impl DataConverter for RuleConverter {
    fn read(&self, opcode: i32, index: i32, value: isize, data: *const c_void) -> EventPayload {
        match self.rules.get(&opcode) {
            Some(PayloadRule::Forbid) => EventPayload::None,
            Some(PayloadRule::Buffer(size)) => {
                if data.is_null() {
                    EventPayload::None
                } else {
                    let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, *size) };
                    EventPayload::Buffer {
                        data: bytes.to_vec(),
                        reserve: 0,
                    }
                }
            }
            None => self.fallback.read(opcode, index, value, data),
        }
    }

    fn write(&self, opcode: i32, data: *mut c_void, response: &EventResult) {
        match (self.rules.get(&opcode), &response.payload) {
            (Some(PayloadRule::Forbid), _) => {}
            (Some(PayloadRule::Buffer(size)), EventPayload::Buffer { data: bytes, .. }) => {
                let n = bytes.len().min(*size);
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), data as *mut u8, n) }
            }
            _ => self.fallback.write(opcode, data, response),
        }
    }
}

/// Forward one call across a channel and block for its response.
///
/// Classifies `data` via the converter, sends the frame, waits for the
/// matching [`EventResult`], writes any returned payload back into `data`,
/// and returns the (converter-mapped) integer result. There is deliberately
/// no timeout: the plugin ABI has no cancellation, so a hung peer hangs the
/// caller the same way a hung in-process plugin would.
pub async fn send_event(
    channel: &mut EventChannel,
    converter: &dyn DataConverter,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> Result<isize> {
    let payload = converter.read(opcode, index, value, data);
    let event = Event {
        opcode,
        index,
        value,
        option,
        payload,
    };
    channel.send(&event).await?;

    let response: EventResult = channel.recv().await?;
    if !data.is_null() {
        converter.write(opcode, data, &response);
    }
    Ok(converter.return_value(opcode, response.return_value))
}

/// Service one incoming call: the mirror of [`send_event`].
///
/// Blocks for a frame, materializes the native argument buffer, invokes
/// `call` with reconstructed arguments, re-reads the buffer according to the
/// original payload shape, and replies. Returns `Err(ChannelClosed)` once the
/// peer is gone, which ends the surrounding loop.
///
/// A blocking function, not a future: the callee is foreign code that may
/// itself re-enter the bridge, a plugin routinely issues a host callback
/// while servicing a forwarded call. Only the socket I/O runs on the
/// runtime; `call` is invoked between the two `block_on` sections so the
/// calling thread is never inside the runtime when foreign code runs.
pub fn passthrough_event<F>(handle: &Handle, channel: &mut EventChannel, call: &mut F) -> Result<()>
where
    F: FnMut(i32, i32, isize, *mut c_void, f32) -> isize,
{
    let event: Event = handle.block_on(channel.recv())?;

    let mut scratch: Option<Vec<u8>> = match &event.payload {
        EventPayload::None => None,
        EventPayload::Str(bytes) => {
            let mut bytes = bytes.clone();
            bytes.push(0);
            Some(bytes)
        }
        EventPayload::Buffer { data, reserve } => {
            let mut bytes = data.clone();
            bytes.resize(data.len() + reserve, 0);
            Some(bytes)
        }
        EventPayload::WantsString => Some(vec![0u8; MAX_STRING_LENGTH]),
    };

    let return_value = {
        let data_ptr = scratch
            .as_mut()
            .map(|b| b.as_mut_ptr() as *mut c_void)
            .unwrap_or(std::ptr::null_mut());
        call(event.opcode, event.index, event.value, data_ptr, event.option)
    };

    let payload = match (&event.payload, scratch) {
        (EventPayload::Str(_), Some(bytes)) | (EventPayload::WantsString, Some(bytes)) => {
            read_back_string(&bytes)
        }
        (EventPayload::Buffer { .. }, Some(bytes)) => EventPayload::Buffer {
            data: bytes,
            reserve: 0,
        },
        _ => EventPayload::None,
    };

    handle.block_on(channel.send(&EventResult {
        return_value,
        payload,
    }))
}

/// A still-zeroed buffer means the callee wrote nothing; report the sentinel
/// so the write-back side leaves the caller's buffer alone.
fn read_back_string(bytes: &[u8]) -> EventPayload {
    match bytes.iter().position(|&b| b == 0) {
        Some(0) => EventPayload::WantsString,
        Some(n) => EventPayload::Str(bytes[..n].to_vec()),
        None => EventPayload::Str(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use tokio::net::UnixStream;

    #[test]
    fn test_default_classification_null_pointer() {
        let converter = DefaultDataConverter;
        let payload = converter.read(0, 0, 0, std::ptr::null());
        assert_eq!(payload, EventPayload::None);
    }

    #[test]
    fn test_default_classification_c_string() {
        let converter = DefaultDataConverter;
        let s = CString::new("Room Reverb").unwrap();
        let payload = converter.read(0, 0, 0, s.as_ptr() as *const c_void);
        assert_eq!(payload, EventPayload::Str(b"Room Reverb".to_vec()));
    }

    #[test]
    fn test_default_classification_zeroed_buffer_is_sentinel() {
        let converter = DefaultDataConverter;
        let buffer = [0u8; 64];
        let payload = converter.read(0, 0, 0, buffer.as_ptr() as *const c_void);
        // Never an empty Str: the caller may just not have cleared its buffer.
        assert_eq!(payload, EventPayload::WantsString);
    }

    #[test]
    fn test_classification_preserves_non_utf8_bytes() {
        let converter = DefaultDataConverter;
        // "Réverb" as Windows-1252 emits it; not valid UTF-8.
        let raw = [b'R', 0xe9, b'v', b'e', b'r', b'b', 0u8];
        let payload = converter.read(0, 0, 0, raw.as_ptr() as *const c_void);
        assert_eq!(
            payload,
            EventPayload::Str(vec![b'R', 0xe9, b'v', b'e', b'r', b'b'])
        );

        // And the round trip back into a caller buffer is byte-exact.
        let mut out = [0u8; 16];
        converter.write(
            0,
            out.as_mut_ptr() as *mut c_void,
            &EventResult {
                return_value: 0,
                payload,
            },
        );
        assert_eq!(&out[..7], &raw);
    }

    #[test]
    fn test_default_write_back_appends_terminator() {
        let converter = DefaultDataConverter;
        let mut buffer = [0xffu8; 32];
        let response = EventResult {
            return_value: 1,
            payload: EventPayload::Str(b"Gain".to_vec()),
        };
        converter.write(0, buffer.as_mut_ptr() as *mut c_void, &response);
        assert_eq!(&buffer[..5], b"Gain\0");
    }

    #[test]
    fn test_default_write_back_ignores_non_string_payloads() {
        let converter = DefaultDataConverter;
        let mut buffer = [0xaau8; 8];
        for payload in [
            EventPayload::None,
            EventPayload::WantsString,
            EventPayload::Buffer {
                data: vec![1, 2, 3],
                reserve: 0,
            },
        ] {
            converter.write(
                0,
                buffer.as_mut_ptr() as *mut c_void,
                &EventResult {
                    return_value: 0,
                    payload,
                },
            );
        }
        assert_eq!(buffer, [0xaau8; 8]);
    }

    #[test]
    fn test_forbid_rule_ignores_aliasing_pointer() {
        let converter = RuleConverter::dispatch().with_rule(42, PayloadRule::Forbid);
        let s = CString::new("not a payload").unwrap();
        let payload = converter.read(42, 0, 0, s.as_ptr() as *const c_void);
        assert_eq!(payload, EventPayload::None);

        // Other opcodes still use the default policy.
        let payload = converter.read(43, 0, 0, s.as_ptr() as *const c_void);
        assert_eq!(payload, EventPayload::Str(b"not a payload".to_vec()));
    }

    #[test]
    fn test_buffer_rule_reads_fixed_size() {
        let converter = RuleConverter::dispatch().with_rule(7, PayloadRule::Buffer(4));
        let buffer = [9u8, 8, 7, 6, 5, 4];
        let payload = converter.read(7, 0, 0, buffer.as_ptr() as *const c_void);
        assert_eq!(
            payload,
            EventPayload::Buffer {
                data: vec![9, 8, 7, 6],
                reserve: 0,
            }
        );
    }

    #[test]
    fn test_buffer_rule_write_back() {
        let converter = RuleConverter::dispatch().with_rule(7, PayloadRule::Buffer(4));
        let mut buffer = [0u8; 4];
        converter.write(
            7,
            buffer.as_mut_ptr() as *mut c_void,
            &EventResult {
                return_value: 0,
                payload: EventPayload::Buffer {
                    data: vec![1, 2, 3, 4],
                    reserve: 0,
                },
            },
        );
        assert_eq!(buffer, [1, 2, 3, 4]);
    }

    #[test]
    fn test_read_back_string() {
        assert_eq!(read_back_string(&[0, 0, 0]), EventPayload::WantsString);
        assert_eq!(read_back_string(b"ok\0\0"), EventPayload::Str(b"ok".to_vec()));
        assert_eq!(read_back_string(b"full"), EventPayload::Str(b"full".to_vec()));
        // Non-UTF-8 survives the read-back untouched.
        assert_eq!(
            read_back_string(&[0xfe, 0xff, 0]),
            EventPayload::Str(vec![0xfe, 0xff])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_event_roundtrip_with_string_write_back() {
        let (stream_a, stream_b) = UnixStream::pair().unwrap();
        let mut host = EventChannel::new(stream_a);
        let mut runner = EventChannel::new(stream_b);

        // Plugin side: assert the reconstructed arguments and write a name
        // into the out-buffer.
        let handle = Handle::current();
        let plugin = tokio::task::spawn_blocking(move || {
            let mut call = |opcode: i32, index: i32, value: isize, data: *mut c_void, option: f32| {
                assert_eq!(opcode, 45);
                assert_eq!(index, 2);
                assert_eq!(value, 99);
                assert_eq!(option, 0.0);
                assert!(!data.is_null());
                unsafe { write_c_string(data, b"Wide Hall") };
                1
            };
            passthrough_event(&handle, &mut runner, &mut call)
        });

        // Host side: an uninitialized (zeroed) out-buffer classifies as the
        // sentinel, and the response string lands in it.
        let converter = DefaultDataConverter;
        let mut buffer = [0u8; 64];
        let result = send_event(
            &mut host,
            &converter,
            45,
            2,
            99,
            buffer.as_mut_ptr() as *mut c_void,
            0.0,
        )
        .await
        .unwrap();

        assert_eq!(result, 1);
        assert_eq!(&buffer[..10], b"Wide Hall\0");
        plugin.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_event_buffer_rule_roundtrip() {
        let (stream_a, stream_b) = UnixStream::pair().unwrap();
        let mut host = EventChannel::new(stream_a);
        let mut runner = EventChannel::new(stream_b);

        let handle = Handle::current();
        let plugin = tokio::task::spawn_blocking(move || {
            let mut call = |_opcode: i32, _index: i32, _value: isize, data: *mut c_void, _option: f32| {
                // Increment every byte of the 4-byte buffer in place.
                let bytes = unsafe { std::slice::from_raw_parts_mut(data as *mut u8, 4) };
                for b in bytes.iter_mut() {
                    *b += 1;
                }
                0
            };
            passthrough_event(&handle, &mut runner, &mut call)
        });

        let converter = RuleConverter::dispatch().with_rule(23, PayloadRule::Buffer(4));
        let mut buffer = [10u8, 20, 30, 40];
        let result = send_event(
            &mut host,
            &converter,
            23,
            0,
            0,
            buffer.as_mut_ptr() as *mut c_void,
            0.0,
        )
        .await
        .unwrap();

        assert_eq!(result, 0);
        assert_eq!(buffer, [11, 21, 31, 41]);
        plugin.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_event_with_null_data() {
        let (stream_a, stream_b) = UnixStream::pair().unwrap();
        let mut host = EventChannel::new(stream_a);
        let mut runner = EventChannel::new(stream_b);

        let handle = Handle::current();
        let plugin = tokio::task::spawn_blocking(move || {
            let mut call = |_o: i32, _i: i32, _v: isize, data: *mut c_void, _f: f32| {
                assert!(data.is_null());
                -2
            };
            passthrough_event(&handle, &mut runner, &mut call)
        });

        let converter = DefaultDataConverter;
        let result = send_event(&mut host, &converter, 8, 0, 0, std::ptr::null_mut(), 0.0)
            .await
            .unwrap();
        assert_eq!(result, -2);
        plugin.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_callee_may_reenter_the_bridge_mid_call() {
        // The shape every real session hits: while servicing a forwarded
        // call the plugin phones home over the callback channel, blocking on
        // the same runtime handle. This must complete, not panic over a
        // nested runtime entry.
        let (dispatch_a, dispatch_b) = UnixStream::pair().unwrap();
        let (callback_a, callback_b) = UnixStream::pair().unwrap();
        let mut dispatch_host = EventChannel::new(dispatch_a);

        let callback_server = tokio::spawn(async move {
            let mut channel = EventChannel::new(callback_a);
            let event: Event = channel.recv().await.unwrap();
            assert_eq!(event.opcode, 3);
            channel
                .send(&EventResult {
                    return_value: 7,
                    payload: EventPayload::None,
                })
                .await
                .unwrap();
        });

        let handle = Handle::current();
        let runner = tokio::task::spawn_blocking(move || {
            let mut dispatch = EventChannel::new(dispatch_b);
            let mut callback = EventChannel::new(callback_b);
            let callback_handle = handle.clone();
            let mut call = move |_o: i32, _i: i32, _v: isize, _d: *mut c_void, _f: f32| {
                callback_handle
                    .block_on(send_event(
                        &mut callback,
                        &DefaultDataConverter,
                        3,
                        0,
                        0,
                        std::ptr::null_mut(),
                        0.0,
                    ))
                    .unwrap()
            };
            passthrough_event(&handle, &mut dispatch, &mut call)
        });

        let result = send_event(
            &mut dispatch_host,
            &DefaultDataConverter,
            40,
            0,
            0,
            std::ptr::null_mut(),
            0.0,
        )
        .await
        .unwrap();

        assert_eq!(result, 7);
        runner.await.unwrap().unwrap();
        callback_server.await.unwrap();
    }
}
