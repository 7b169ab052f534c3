//! The compile-time static function table: the ground truth both the
//! installer and the consumer index by position. This order defines the
//! global patch index space (spec.md §4.6) — it must be identical in both
//! components, which is exactly why it lives in the crate they both depend
//! on rather than being duplicated.

use crate::patch::{ArgFormat, ErrorConvention, StringArgs};

#[derive(Copy, Clone, Debug)]
pub struct FunctionTableEntry {
    pub lib_name: &'static str,
    pub func_name: &'static str,
    pub lib_id: u8,
    pub lvo: i16,
    pub arg_count: u8,
    pub arg_regs: [u8; 8],
    pub return_reg: u8,
    pub string_args: StringArgs,
    pub error_convention: ErrorConvention,
    pub return_format: ArgFormat,
    /// High-frequency primitive auto-disabled on a fresh install unless
    /// explicitly named (spec.md §4.1 "Noise policy").
    pub noise: bool,
}

impl FunctionTableEntry {
    pub const fn qualified_name(&self) -> (&'static str, &'static str) {
        (self.lib_name, self.func_name)
    }
}

macro_rules! entry {
    ($lib_name:expr, $func_name:expr, $lib_id:expr, $lvo:expr, $arg_count:expr,
     $arg_regs:expr, $return_reg:expr, $string_args:expr, $error:expr,
     $format:expr, $noise:expr) => {
        FunctionTableEntry {
            lib_name: $lib_name,
            func_name: $func_name,
            lib_id: $lib_id,
            lvo: $lvo,
            arg_count: $arg_count,
            arg_regs: $arg_regs,
            return_reg: $return_reg,
            string_args: StringArgs($string_args),
            error_convention: $error,
            return_format: $format,
            noise: $noise,
        }
    };
}

/// exec.library's id, used throughout the table and the worked examples in
/// spec.md §8.
pub const LIB_EXEC: u8 = 0;
pub const LIB_DOS: u8 = 1;

pub const FUNC_ID_UNKNOWN: u16 = u16::MAX;

/// Compile-time list of every traced function and its metadata. Order is
/// load-bearing: it *is* the global patch index space.
pub const TABLE: &[FunctionTableEntry] = &[
    entry!(
        "exec", "OpenLibrary", LIB_EXEC, -552, 2,
        [0, 1, 0, 0, 0, 0, 0, 0], 0, 0b0000_0001,
        ErrorConvention::PointerNullIsError, ArgFormat::Hex, false
    ),
    entry!(
        "exec", "FindTask", LIB_EXEC, -294, 1,
        [0, 0, 0, 0, 0, 0, 0, 0], 0, 0b0000_0001,
        ErrorConvention::PointerNullIsError, ArgFormat::Hex, false
    ),
    entry!(
        "exec", "FindPort", LIB_EXEC, -390, 1,
        [0, 0, 0, 0, 0, 0, 0, 0], 0, 0b0000_0001,
        ErrorConvention::PointerNullIsError, ArgFormat::Hex, false
    ),
    entry!(
        "exec", "AllocMem", LIB_EXEC, -198, 2,
        [0, 1, 0, 0, 0, 0, 0, 0], 0, 0b0000_0000,
        ErrorConvention::PointerNullIsError, ArgFormat::FlagWord, true
    ),
    entry!(
        "exec", "FreeMem", LIB_EXEC, -210, 2,
        [0, 1, 0, 0, 0, 0, 0, 0], 0, 0b0000_0000,
        ErrorConvention::Void, ArgFormat::Hex, true
    ),
    entry!(
        "dos", "Open", LIB_DOS, -30, 2,
        [0, 1, 0, 0, 0, 0, 0, 0], 0, 0b0000_0001,
        ErrorConvention::PointerNullIsError, ArgFormat::LockHandle, false
    ),
    entry!(
        "dos", "Close", LIB_DOS, -36, 1,
        [0, 0, 0, 0, 0, 0, 0, 0], 0, 0b0000_0000,
        ErrorConvention::ZeroIsSuccess, ArgFormat::Hex, false
    ),
    entry!(
        "dos", "Read", LIB_DOS, -42, 3,
        [0, 1, 2, 0, 0, 0, 0, 0], 0, 0b0000_0000,
        ErrorConvention::NegativeIsError, ArgFormat::Decimal, true
    ),
    entry!(
        "dos", "Write", LIB_DOS, -48, 3,
        [0, 1, 2, 0, 0, 0, 0, 0], 0, 0b0000_0000,
        ErrorConvention::NegativeIsError, ArgFormat::Decimal, true
    ),
    entry!(
        "dos", "Lock", LIB_DOS, -84, 2,
        [0, 1, 0, 0, 0, 0, 0, 0], 0, 0b0000_0001,
        ErrorConvention::PointerNullIsError, ArgFormat::LockHandle, false
    ),
    entry!(
        "dos", "UnLock", LIB_DOS, -90, 1,
        [0, 0, 0, 0, 0, 0, 0, 0], 0, 0b0000_0000,
        ErrorConvention::Void, ArgFormat::Hex, false
    ),
];

pub fn find_by_name(lib: &str, func: &str) -> Option<(usize, &'static FunctionTableEntry)> {
    TABLE
        .iter()
        .enumerate()
        .find(|(_, e)| e.lib_name.eq_ignore_ascii_case(lib) && e.func_name == func)
}

pub fn find_by_func_name(func: &str) -> Option<(usize, &'static FunctionTableEntry)> {
    TABLE.iter().enumerate().find(|(_, e)| e.func_name == func)
}

pub fn find_by_lvo(lib_id: u8, lvo: i16) -> Option<&'static FunctionTableEntry> {
    TABLE
        .iter()
        .find(|e| e.lib_id == lib_id && e.lvo == lvo)
}

pub fn noise_function_names() -> Vec<&'static str> {
    TABLE.iter().filter(|e| e.noise).map(|e| e.func_name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn no_duplicate_patch_sites() {
        let mut seen = HashSet::new();
        for e in TABLE {
            assert!(
                seen.insert((e.lib_id, e.lvo)),
                "duplicate (lib_id, lvo) for {}.{}",
                e.lib_name,
                e.func_name
            );
        }
    }

    #[test]
    fn lookup_by_name_is_case_insensitive_on_library() {
        let (_, entry) = find_by_name("EXEC", "OpenLibrary").expect("present");
        assert_eq!(entry.func_name, "OpenLibrary");
    }

    #[test]
    fn lookup_by_lvo_round_trips() {
        let entry = find_by_lvo(LIB_EXEC, -552).expect("present");
        assert_eq!(entry.func_name, "OpenLibrary");
    }

    #[test]
    fn noise_functions_are_a_small_named_subset() {
        let noise = noise_function_names();
        assert!(noise.contains(&"AllocMem"));
        assert!(!noise.contains(&"OpenLibrary"));
    }
}
