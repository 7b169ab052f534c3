//! Generated-stub code generator.
//!
//! spec.md §4.2 is explicit that the generator "does not assemble from
//! mnemonics": it copies a prefix template, builds a variable region from
//! the patch descriptor, copies a suffix template, then rewrites a small set
//! of byte offsets — addresses, structure-field displacements, branch
//! distances. Design note §9 ("No dynamic dispatch tables in the rewrite")
//! asks for that rewriting to be a typed `PatchSite` enum rather than a
//! hand-laid machine-word array, which is what this crate builds.
//!
//! There is no m68k/AmigaOS assembler target in a hosted Rust toolchain, so
//! the template bytes here are opaque placeholders rather than real machine
//! code — see DESIGN.md's Open Question resolution on this. What *is* fully
//! implemented and tested is the part spec.md calls load-bearing: template
//! lengths, patch-site offsets, and the rewrite arithmetic.

use atrace_common::patch::{ENABLED_OFFSET, USE_COUNT_OFFSET};
use atrace_common::{
    FuncPtr, PatchDescriptor, StringArgs, FILTER_TASK_OFFSET, GLOBAL_ENABLE_OFFSET,
};
use atrace_platform::{exec_page, ExecPage};
use thiserror::Error;

/// Which absolute address a [`PatchSite::Address`] carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressSlot {
    PatchDescriptor,
    Anchor,
    RingBase,
    /// Patched in after the jump-table swap, once the original vector is
    /// known; appears three times per spec.md §4.2 ("patched post-swap").
    Original,
}

/// Which structure field a [`PatchSite::Displacement`] carries the byte
/// offset of, computed once from the native layout of anchor/patch/ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldRef {
    AnchorGlobalEnable,
    AnchorFilterTask,
    PatchEnabled,
    PatchUseCount,
    RingWritePos,
    RingReadPos,
    RingOverflow,
}

impl FieldRef {
    fn offset(self) -> usize {
        match self {
            FieldRef::AnchorGlobalEnable => GLOBAL_ENABLE_OFFSET,
            FieldRef::AnchorFilterTask => FILTER_TASK_OFFSET,
            FieldRef::PatchEnabled => ENABLED_OFFSET,
            FieldRef::PatchUseCount => USE_COUNT_OFFSET,
            FieldRef::RingWritePos => atrace_common::WRITE_POS_OFFSET,
            FieldRef::RingReadPos => atrace_common::READ_POS_OFFSET,
            FieldRef::RingOverflow => atrace_common::OVERFLOW_OFFSET,
        }
    }
}

/// Which suffix entry point a [`PatchSite::Branch`] distance reaches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchTarget {
    Disabled,
    Overflow,
}

/// A single placeholder location inside a template that the generator
/// rewrites before flushing the instruction cache. `offset` is relative to
/// the start of the region the site table belongs to (prefix, variable, or
/// suffix).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchSite {
    Address { offset: usize, which: AddressSlot },
    Displacement { offset: usize, field: FieldRef },
    Branch { offset: usize, target: BranchTarget },
}

/// Width, in bytes, of one rewritten site. Addresses and displacements are
/// native `usize` words; branch distances are a 32-bit relative offset.
fn site_width(site: &PatchSite) -> usize {
    match site {
        PatchSite::Address { .. } | PatchSite::Displacement { .. } => std::mem::size_of::<usize>(),
        PatchSite::Branch { .. } => std::mem::size_of::<i32>(),
    }
}

/// Fixed prefix: enable checks, caller filter, register save, ring
/// reservation, event header population (spec.md §4.2 steps 1-6). The byte
/// content is an opaque placeholder; only its length and site offsets are
/// load-bearing in a hosted build.
pub const PREFIX_TEMPLATE: &[u8] = &[0xCC; 64];

/// Fixed suffix: forward to original, post-call handler, disabled and
/// overflow fast paths (spec.md §4.2 steps 8-9 plus the two fast paths).
pub const SUFFIX_TEMPLATE: &[u8] = &[0xCC; 48];

fn prefix_patch_sites() -> Vec<PatchSite> {
    vec![
        PatchSite::Address { offset: 4, which: AddressSlot::PatchDescriptor },
        PatchSite::Displacement { offset: 12, field: FieldRef::PatchEnabled },
        PatchSite::Address { offset: 16, which: AddressSlot::Anchor },
        PatchSite::Displacement { offset: 20, field: FieldRef::AnchorGlobalEnable },
        PatchSite::Displacement { offset: 24, field: FieldRef::AnchorFilterTask },
        PatchSite::Address { offset: 32, which: AddressSlot::RingBase },
        PatchSite::Displacement { offset: 36, field: FieldRef::RingWritePos },
        PatchSite::Displacement { offset: 40, field: FieldRef::RingReadPos },
        PatchSite::Displacement { offset: 44, field: FieldRef::RingOverflow },
        PatchSite::Address { offset: 48, which: AddressSlot::PatchDescriptor },
        PatchSite::Displacement { offset: 56, field: FieldRef::PatchUseCount },
    ]
}

fn suffix_patch_sites() -> Vec<PatchSite> {
    vec![
        PatchSite::Address { offset: 0, which: AddressSlot::Original },
        PatchSite::Address { offset: 8, which: AddressSlot::Original },
        PatchSite::Address { offset: 16, which: AddressSlot::Original },
        PatchSite::Address { offset: 24, which: AddressSlot::PatchDescriptor },
        PatchSite::Displacement { offset: 32, field: FieldRef::PatchUseCount },
        PatchSite::Branch { offset: 36, target: BranchTarget::Disabled },
        PatchSite::Branch { offset: 40, target: BranchTarget::Overflow },
    ]
}

#[derive(Debug, Error)]
pub enum StubError {
    #[error("template too short: need {need} bytes at offset {offset}, region is {len} bytes")]
    SiteOutOfBounds { offset: usize, need: usize, len: usize },
    #[error("failed to allocate executable memory: {0}")]
    Alloc(#[from] std::io::Error),
}

/// The three pieces of runtime address information the generator needs
/// beyond the descriptor itself.
#[derive(Copy, Clone, Debug)]
pub struct StubContext {
    pub anchor_addr: usize,
    pub ring_base_addr: usize,
    pub patch_addr: usize,
}

/// Build the variable region: per-function argument capture and one
/// optional inline string copy (spec.md §4.2 step 7). Each argument is a
/// fixed-width placeholder "load register, store to slot.args[i]"; the
/// string block is present only when `string_args` has a bit set.
fn build_variable_region(desc: &PatchDescriptor) -> Vec<u8> {
    let arg_count = (desc.arg_count as usize).min(atrace_common::MAX_ARGS);
    let mut region = Vec::with_capacity(arg_count * 4 + 8);
    for i in 0..arg_count {
        // Placeholder "mov args[i] <- reg" — the real encoding would embed
        // desc.arg_regs[i] as a register operand.
        region.extend_from_slice(&[0xD0, desc.arg_regs[i], i as u8, 0x00]);
    }
    if desc.string_args.has_any() {
        let reg = desc.string_args.lowest_set_bit().unwrap_or(0);
        region.extend_from_slice(&[0xD1, reg, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }
    region
}

pub struct GeneratedStub {
    pub page: ExecPage,
    pub total_len: usize,
    pub prefix_len: usize,
    pub variable_len: usize,
    pub suffix_len: usize,
}

pub struct StubGenerator;

impl StubGenerator {
    pub fn generate(desc: &PatchDescriptor, ctx: &StubContext) -> Result<GeneratedStub, StubError> {
        let variable = build_variable_region(desc);

        let mut buf = Vec::with_capacity(PREFIX_TEMPLATE.len() + variable.len() + SUFFIX_TEMPLATE.len());
        buf.extend_from_slice(PREFIX_TEMPLATE);
        buf.extend_from_slice(&variable);
        buf.extend_from_slice(SUFFIX_TEMPLATE);

        let prefix_len = PREFIX_TEMPLATE.len();
        let suffix_base = prefix_len + variable.len();

        for site in prefix_patch_sites() {
            write_site(&mut buf, 0, &site, desc, ctx, variable.len())?;
        }
        for site in suffix_patch_sites() {
            write_site(&mut buf, suffix_base, &site, desc, ctx, variable.len())?;
        }

        let mut page = exec_page::alloc_executable(buf.len())?;
        page.as_mut_slice().copy_from_slice(&buf);
        exec_page::flush_icache(page.as_ptr(), page.len());

        Ok(GeneratedStub {
            total_len: buf.len(),
            prefix_len,
            variable_len: variable.len(),
            suffix_len: SUFFIX_TEMPLATE.len(),
            page,
        })
    }
}

/// Re-patch the three `Original` address occurrences inside an already
/// generated stub, once the jump-table swap has revealed the value — spec.md
/// §4.1's install algorithm step 3: generate first (the original is not yet
/// known), swap, then patch the stub with what the swap returned.
pub fn patch_original(stub: &mut GeneratedStub, original: FuncPtr) {
    let suffix_base = stub.prefix_len + stub.variable_len;
    let width = std::mem::size_of::<usize>();
    let buf = stub.page.as_mut_slice();
    for site in suffix_patch_sites() {
        if let PatchSite::Address { offset, which: AddressSlot::Original } = site {
            let at = suffix_base + offset;
            buf[at..at + width].copy_from_slice(&original.0.to_ne_bytes());
        }
    }
    exec_page::flush_icache(stub.page.as_ptr(), stub.page.len());
}

/// Rewrite one patch site inside `buf`, at `region_base + site.offset()`.
fn write_site(
    buf: &mut [u8],
    region_base: usize,
    site: &PatchSite,
    desc: &PatchDescriptor,
    ctx: &StubContext,
    variable_len: usize,
) -> Result<(), StubError> {
    let offset = region_base
        + match site {
            PatchSite::Address { offset, .. } => *offset,
            PatchSite::Displacement { offset, .. } => *offset,
            PatchSite::Branch { offset, .. } => *offset,
        };
    let width = site_width(site);
    if offset + width > buf.len() {
        return Err(StubError::SiteOutOfBounds { offset, need: width, len: buf.len() });
    }
    match site {
        PatchSite::Address { which, .. } => {
            let addr = match which {
                AddressSlot::PatchDescriptor => ctx.patch_addr,
                AddressSlot::Anchor => ctx.anchor_addr,
                AddressSlot::RingBase => ctx.ring_base_addr,
                AddressSlot::Original => desc.original.0,
            };
            buf[offset..offset + width].copy_from_slice(&addr.to_ne_bytes());
        }
        PatchSite::Displacement { field, .. } => {
            let disp = field.offset();
            buf[offset..offset + width].copy_from_slice(&disp.to_ne_bytes());
        }
        PatchSite::Branch { target, .. } => {
            // Distance back to the start of the variable region from this
            // site, negated (a backward branch). Real encodings would also
            // need the site's own instruction length folded in; that detail
            // doesn't survive the move to opaque placeholder bytes.
            let distance = match target {
                BranchTarget::Disabled => -(variable_len as i32),
                BranchTarget::Overflow => -(variable_len as i32) - 4,
            };
            buf[offset..offset + width].copy_from_slice(&distance.to_ne_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrace_common::FuncPtr;
    use std::sync::atomic::AtomicU32;

    fn sample_descriptor(arg_count: u8, string_args: StringArgs) -> PatchDescriptor {
        PatchDescriptor {
            lib_id: 1,
            lvo: -552,
            func_id: 0,
            arg_count,
            enabled: AtomicU32::new(1),
            use_count: AtomicU32::new(0),
            original: FuncPtr(0xDEAD_BEEF),
            stub_addr: 0,
            stub_size: 0,
            arg_regs: [0, 1, 2, 3, 0, 0, 0, 0],
            string_args,
        }
    }

    fn sample_context() -> StubContext {
        StubContext {
            anchor_addr: 0x1000,
            ring_base_addr: 0x2000,
            patch_addr: 0x3000,
        }
    }

    #[test]
    fn generated_stub_length_is_prefix_plus_variable_plus_suffix() {
        let desc = sample_descriptor(2, StringArgs::NONE);
        let stub = StubGenerator::generate(&desc, &sample_context()).unwrap();
        assert_eq!(stub.prefix_len, PREFIX_TEMPLATE.len());
        assert_eq!(stub.suffix_len, SUFFIX_TEMPLATE.len());
        assert_eq!(stub.variable_len, 2 * 4);
        assert_eq!(stub.total_len, stub.prefix_len + stub.variable_len + stub.suffix_len);
        assert_eq!(stub.page.len(), stub.total_len);
    }

    #[test]
    fn string_argument_adds_eight_bytes_to_the_variable_region() {
        let desc = sample_descriptor(1, StringArgs(0b0000_0010));
        let stub = StubGenerator::generate(&desc, &sample_context()).unwrap();
        assert_eq!(stub.variable_len, 4 + 8);
    }

    #[test]
    fn arguments_beyond_four_are_dropped_from_the_variable_region() {
        let desc = sample_descriptor(7, StringArgs::NONE);
        let stub = StubGenerator::generate(&desc, &sample_context()).unwrap();
        assert_eq!(stub.variable_len, atrace_common::MAX_ARGS * 4);
    }

    #[test]
    fn original_address_is_patched_into_all_three_suffix_occurrences() {
        let desc = sample_descriptor(0, StringArgs::NONE);
        let ctx = sample_context();
        let stub = StubGenerator::generate(&desc, &ctx).unwrap();
        let suffix_base = stub.prefix_len + stub.variable_len;
        let bytes = stub.page.as_slice();
        for offset in [0usize, 8, 16] {
            let at = suffix_base + offset;
            let word = usize::from_ne_bytes(bytes[at..at + std::mem::size_of::<usize>()].try_into().unwrap());
            assert_eq!(word, desc.original.0);
        }
    }

    #[test]
    fn patch_descriptor_address_appears_in_the_prefix() {
        let desc = sample_descriptor(0, StringArgs::NONE);
        let ctx = sample_context();
        let stub = StubGenerator::generate(&desc, &ctx).unwrap();
        let bytes = stub.page.as_slice();
        let word = usize::from_ne_bytes(bytes[4..4 + std::mem::size_of::<usize>()].try_into().unwrap());
        assert_eq!(word, ctx.patch_addr);
    }

    #[test]
    fn patch_original_rewrites_all_three_occurrences() {
        let mut desc = sample_descriptor(0, StringArgs::NONE);
        desc.original = FuncPtr::NULL;
        let ctx = sample_context();
        let mut stub = StubGenerator::generate(&desc, &ctx).unwrap();
        patch_original(&mut stub, FuncPtr(0x7777));

        let suffix_base = stub.prefix_len + stub.variable_len;
        let bytes = stub.page.as_slice();
        for offset in [0usize, 8, 16] {
            let at = suffix_base + offset;
            let word = usize::from_ne_bytes(bytes[at..at + std::mem::size_of::<usize>()].try_into().unwrap());
            assert_eq!(word, 0x7777);
        }
    }

    #[test]
    fn branch_displacement_tracks_actual_variable_region_length() {
        let desc = sample_descriptor(3, StringArgs::NONE);
        let ctx = sample_context();
        let stub = StubGenerator::generate(&desc, &ctx).unwrap();
        let suffix_base = stub.prefix_len + stub.variable_len;
        let bytes = stub.page.as_slice();
        let at = suffix_base + 36;
        let disp = i32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(disp, -(stub.variable_len as i32));
    }
}
