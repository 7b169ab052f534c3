//! Per-function patch descriptor: the runtime record describing one
//! installed stub, and the error-convention tags the consumer's status
//! column keys off.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::anchor::FuncPtr;

/// How a traced function reports failure. The consumer's line formatter
/// reproduces this mapping exactly rather than guessing — see spec.md §9's
/// open question about "semi-error" return conventions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorConvention {
    /// Pointer return; zero means failure.
    PointerNullIsError,
    /// Zero means success, non-zero is an error code.
    ZeroIsSuccess,
    /// Signed return; negative means failure.
    NegativeIsError,
    /// Return code convention where zero still means success but the
    /// function is not pointer-shaped (kept distinct from `ZeroIsSuccess`
    /// because its retval is formatted as a decimal code, not a flag word).
    ReturnCodeZeroIsSuccess,
    /// No function result to judge (the call is void).
    Void,
    /// No consistent convention; always displayed as neutral.
    NoConvention,
}

/// One tab-column status character, matching spec.md §4.5.2 exactly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Neutral,
}

impl Status {
    pub fn as_char(self) -> char {
        match self {
            Status::Ok => 'O',
            Status::Error => 'E',
            Status::Neutral => '-',
        }
    }
}

impl ErrorConvention {
    /// Classify a raw `retval` per this convention. `errors_only` filtering
    /// and the `status` wire column both derive from this.
    pub fn status(self, retval: u32) -> Status {
        match self {
            ErrorConvention::PointerNullIsError => {
                if retval == 0 {
                    Status::Error
                } else {
                    Status::Ok
                }
            }
            ErrorConvention::ZeroIsSuccess => {
                if retval == 0 {
                    Status::Ok
                } else {
                    Status::Error
                }
            }
            ErrorConvention::NegativeIsError => {
                if (retval as i32) < 0 {
                    Status::Error
                } else {
                    Status::Ok
                }
            }
            ErrorConvention::ReturnCodeZeroIsSuccess => {
                if retval == 0 {
                    Status::Ok
                } else {
                    Status::Error
                }
            }
            ErrorConvention::Void => Status::Neutral,
            ErrorConvention::NoConvention => Status::Neutral,
        }
    }
}

/// How to render a captured argument or return value in the formatted line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArgFormat {
    Hex,
    Decimal,
    CString,
    /// Decoded into symbolic flag names (e.g. allocation requirements,
    /// scope enums) by a per-function table the consumer owns.
    FlagWord,
    /// Opaque handle that a lock-like function returned; later events that
    /// consume it are looked up in the lock-to-path cache.
    LockHandle,
}

/// Bitmap over up to 8 arguments: bit *i* set means "argument *i* is a
/// C string — capture it".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StringArgs(pub u8);

impl StringArgs {
    pub const NONE: StringArgs = StringArgs(0);

    pub fn lowest_set_bit(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    pub fn has_any(self) -> bool {
        self.0 != 0
    }
}

/// Runtime record describing one installed stub. Stable after installation
/// except for `enabled` and `use_count`, which the stub touches on every
/// call and the installer's `DISABLE`/`ENABLE`/drain logic touches too.
/// `repr(C)` because the stub generator patches in `enabled`/`use_count`'s
/// byte offset as an immediate displacement.
#[repr(C)]
pub struct PatchDescriptor {
    pub lib_id: u8,
    pub lvo: i16,
    pub func_id: u16,
    pub arg_count: u8,
    pub enabled: AtomicU32,
    pub use_count: AtomicU32,
    pub original: FuncPtr,
    pub stub_addr: usize,
    pub stub_size: usize,
    pub arg_regs: [u8; 8],
    pub string_args: StringArgs,
}

impl PatchDescriptor {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) != 0
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled as u32, Ordering::Release);
    }

    pub fn enter(&self) {
        self.use_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit(&self) {
        self.use_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }
}

/// Byte offset of `enabled` within [`PatchDescriptor`], for the stub
/// generator's `Displacement` patch sites.
pub const ENABLED_OFFSET: usize = std::mem::offset_of!(PatchDescriptor, enabled);
/// Byte offset of `use_count` within [`PatchDescriptor`].
pub const USE_COUNT_OFFSET: usize = std::mem::offset_of!(PatchDescriptor, use_count);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_conventions_map_to_the_documented_status() {
        assert_eq!(
            ErrorConvention::PointerNullIsError.status(0),
            Status::Error
        );
        assert_eq!(
            ErrorConvention::PointerNullIsError.status(1),
            Status::Ok
        );
        assert_eq!(ErrorConvention::ZeroIsSuccess.status(0), Status::Ok);
        assert_eq!(ErrorConvention::ZeroIsSuccess.status(7), Status::Error);
        assert_eq!(
            ErrorConvention::NegativeIsError.status((-1i32) as u32),
            Status::Error
        );
        assert_eq!(ErrorConvention::NegativeIsError.status(1), Status::Ok);
        assert_eq!(
            ErrorConvention::ReturnCodeZeroIsSuccess.status(0),
            Status::Ok
        );
        assert_eq!(
            ErrorConvention::ReturnCodeZeroIsSuccess.status(5),
            Status::Error
        );
        assert_eq!(ErrorConvention::Void.status(0), Status::Neutral);
        assert_eq!(ErrorConvention::NoConvention.status(123), Status::Neutral);
    }

    #[test]
    fn string_args_lowest_bit() {
        let bits = StringArgs(0b0000_1010);
        assert_eq!(bits.lowest_set_bit(), Some(1));
        assert!(bits.has_any());
        assert_eq!(StringArgs::NONE.lowest_set_bit(), None);
    }
}
