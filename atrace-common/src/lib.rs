//! Shared wire layout for the atrace syscall tracer core.
//!
//! This crate holds exactly the data model of spec.md §3: the anchor, the
//! ring header, the 64-byte event slot, the patch descriptor, and the static
//! function table. Nothing here is OS-specific — see `atrace-platform` for
//! the traits that bridge to a real host.

pub mod anchor;
pub mod function_table;
pub mod patch;
pub mod ring_header;
pub mod slot;

pub use anchor::{
    Anchor, CallerId, FuncPtr, LibBase, ANCHOR_MAGIC, ANCHOR_NAME, ANCHOR_VERSION,
    EVENT_SEQUENCE_OFFSET, FILTER_TASK_OFFSET, GLOBAL_ENABLE_OFFSET,
};
pub use function_table::{FunctionTableEntry, TABLE};
pub use patch::{
    ArgFormat, ErrorConvention, PatchDescriptor, Status, StringArgs, ENABLED_OFFSET,
    USE_COUNT_OFFSET,
};
pub use ring_header::{
    RingHeader, DEFAULT_RING_CAPACITY, MIN_RING_CAPACITY, OVERFLOW_OFFSET, READ_POS_OFFSET,
    WRITE_POS_OFFSET,
};
pub use slot::{EventSlot, MAX_ARGS, STRING_CAPTURE_BODY, STRING_CAPTURE_LEN};
