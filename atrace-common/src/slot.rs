//! The 64-byte event slot. Field offsets are part of the wire contract: the
//! (simulated) stub code generator writes into a slot by immediate byte
//! displacement, so a size- or offset-changing edit here must be caught at
//! compile time, not at review time.

use bytemuck::{Pod, Zeroable};

/// Number of argument words captured per event.
pub const MAX_ARGS: usize = 4;
/// Capacity of the inline string capture, including the NUL terminator.
pub const STRING_CAPTURE_LEN: usize = 24;
/// Bytes actually copied from the source string before NUL-terminating.
pub const STRING_CAPTURE_BODY: usize = STRING_CAPTURE_LEN - 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventSlot {
    /// 0/1; a slot is stable (safe to consume and overwrite) iff this is 1.
    pub valid: u8,
    pub lib_id: u8,
    /// Signed jump-table offset (LVO) of the traced function.
    pub lvo: i16,
    pub sequence: u32,
    /// Opaque caller identity (the OS scheduler's current-task pointer).
    pub caller: u32,
    pub args: [u32; MAX_ARGS],
    pub retval: u32,
    /// `min(actual_arg_count, MAX_ARGS)`.
    pub arg_count: u8,
    _padding: u8,
    /// NUL-padded capture of one string argument, 23 bytes of body + NUL.
    pub string_data: [u8; STRING_CAPTURE_LEN],
    _reserved: [u8; 6],
}

impl EventSlot {
    pub const fn zeroed() -> Self {
        Self {
            valid: 0,
            lib_id: 0,
            lvo: 0,
            sequence: 0,
            caller: 0,
            args: [0; MAX_ARGS],
            retval: 0,
            arg_count: 0,
            _padding: 0,
            string_data: [0; STRING_CAPTURE_LEN],
            _reserved: [0; 6],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid == 1
    }

    /// Copy `src` into `string_data`, stopping at the first NUL and always
    /// leaving the result NUL-terminated. `src` being empty writes an empty
    /// string, never dereferences anything (the null-pointer case is handled
    /// by the caller before this is reached).
    pub fn set_string(&mut self, src: &[u8]) {
        let n = src
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(src.len())
            .min(STRING_CAPTURE_BODY);
        self.string_data = [0; STRING_CAPTURE_LEN];
        self.string_data[..n].copy_from_slice(&src[..n]);
    }

    /// True when the captured string very likely got truncated: it fills the
    /// entire body and the source was longer than what we kept (the stub
    /// cannot know the true source length; this is a best-effort heuristic
    /// the consumer's line formatter uses to append a `…` marker).
    pub fn string_is_truncated(&self, original_len: usize) -> bool {
        self.string_data[STRING_CAPTURE_BODY - 1] != 0 && original_len > STRING_CAPTURE_BODY
    }

    /// Best-effort truncation heuristic for a consumer that never learns the
    /// source string's true length: the capture filled its entire body, so
    /// it is likely (but not certain) that more was cut off.
    pub fn string_is_full(&self) -> bool {
        self.string_data[STRING_CAPTURE_BODY - 1] != 0
    }

    pub fn string_as_str(&self) -> &str {
        let n = self
            .string_data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STRING_CAPTURE_LEN);
        std::str::from_utf8(&self.string_data[..n]).unwrap_or("?")
    }
}
