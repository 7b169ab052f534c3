//! Line formatting (spec.md §4.5.2): one tab-separated record per event.

use atrace_common::function_table::FunctionTableEntry;
use atrace_common::{ArgFormat, EventSlot, MAX_ARGS};

use crate::lock_path_cache::LockPathCache;

/// Symbolic names for the `exec.library` allocation-requirements flag word,
/// the one flag-word argument the static table currently names (`AllocMem`'s
/// second argument). Unrecognized bits fall back to a raw hex remainder.
const MEMORY_FLAG_NAMES: &[(u32, &str)] = &[
    (0x0000_0001, "MEMF_PUBLIC"),
    (0x0000_0002, "MEMF_CHIP"),
    (0x0000_0004, "MEMF_FAST"),
    (0x0000_0010, "MEMF_CLEAR"),
    (0x0000_0020, "MEMF_LARGEST"),
];

pub fn decode_flags(word: u32) -> String {
    let mut names = Vec::new();
    let mut remainder = word;
    for &(bit, name) in MEMORY_FLAG_NAMES {
        if word & bit != 0 {
            names.push(name);
            remainder &= !bit;
        }
    }
    if names.is_empty() {
        return format!("0x{word:x}");
    }
    if remainder != 0 {
        names.push("?");
    }
    let joined = names.join("|");
    if remainder != 0 {
        format!("{joined}(0x{remainder:x})")
    } else {
        joined
    }
}

fn format_one_arg(
    slot: &EventSlot,
    arg_index: u8,
    entry: &FunctionTableEntry,
    lock_paths: &LockPathCache,
) -> String {
    if entry.string_args.lowest_set_bit() == Some(arg_index) {
        let s = slot.string_as_str();
        let marker = if slot.string_is_full() { "\u{2026}" } else { "" };
        return format!("\"{s}{marker}\"");
    }
    let word = slot.args[arg_index as usize];
    if let Some(path) = lock_paths.get(word) {
        return format!("\"{path}\"");
    }
    format!("0x{word:x}")
}

pub fn format_args(slot: &EventSlot, entry: &FunctionTableEntry, lock_paths: &LockPathCache) -> String {
    let count = (entry.arg_count as usize).min(MAX_ARGS);
    (0..count)
        .map(|i| format_one_arg(slot, i as u8, entry, lock_paths))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format the retval column and, for lock-returning functions, record the
/// handle → path association the lock-to-path cache will serve later.
pub fn format_retval(slot: &EventSlot, entry: &FunctionTableEntry, lock_paths: &mut LockPathCache) -> String {
    match entry.return_format {
        ArgFormat::Hex => format!("0x{:x}", slot.retval),
        ArgFormat::Decimal => format!("{}", slot.retval as i32),
        ArgFormat::CString => format!("\"{}\"", slot.string_as_str()),
        ArgFormat::FlagWord => decode_flags(slot.retval),
        ArgFormat::LockHandle => {
            if slot.retval != 0 {
                let path = slot.string_as_str();
                if !path.is_empty() {
                    lock_paths.insert(slot.retval, path.to_string());
                }
            }
            format!("0x{:x}", slot.retval)
        }
    }
}

/// Build the full tab-separated line for one event, given its already
/// resolved caller name and the batch's sampled timestamp.
pub fn format_event(
    slot: &EventSlot,
    timestamp_ms: u64,
    caller_name: &str,
    entry: Option<&FunctionTableEntry>,
    lock_paths: &mut LockPathCache,
) -> String {
    let (lib_func, args, retval, status) = match entry {
        Some(e) => {
            let lib_func = format!("{}.{}", e.lib_name, e.func_name);
            let args = format_args(slot, e, lock_paths);
            let retval = format_retval(slot, e, lock_paths);
            let status = e.error_convention.status(slot.retval).as_char();
            (lib_func, args, retval, status)
        }
        None => (
            "?.?".to_string(),
            String::new(),
            format!("0x{:x}", slot.retval),
            atrace_common::Status::Neutral.as_char(),
        ),
    };
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        slot.sequence, timestamp_ms, lib_func, caller_name, args, retval, status
    )
}
