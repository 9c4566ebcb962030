//! The descriptor chain walker (§4.C): turns a head index plus a
//! descriptor table into a resolved [`Iov`], entirely as a pure
//! function over already-translated memory so it can be exercised
//! without a live queue.
//!
//! Grounded directly on `virtq_test.cpp`'s chain-construction helpers:
//! every rejection here (`oob_descriptor_test`, `descriptor_loop_test`,
//! `bad_indirect_descriptor_test`, `bad_indirect_descriptor_table_size_test`)
//! has a matching integration test that builds the exact chain shape
//! the original harness does.

use zerocopy::LayoutVerified;

use crate::descriptor::{DescFlags, Descriptor, DESCRIPTOR_SIZE};
use crate::error::{Error, ProtocolError};
use crate::iov::{Iov, IovBuilder};
use crate::memmap::{HostPtr, MemoryMap};

/// Reads the `idx`-th descriptor out of `table`. `table` must be at
/// least `(idx + 1) * DESCRIPTOR_SIZE` bytes; callers always derive
/// `idx` from a bounds check against the table's known domain before
/// calling this.
fn read_descriptor(table: &HostPtr, idx: usize) -> Descriptor {
    let offset = idx * DESCRIPTOR_SIZE;
    // SAFETY: `offset + DESCRIPTOR_SIZE <= table.len()` is guaranteed
    // by every call site checking `idx < domain` first, where `domain`
    // was computed as `table.len() / DESCRIPTOR_SIZE`.
    let bytes = unsafe {
        std::slice::from_raw_parts(table.as_ptr().add(offset), DESCRIPTOR_SIZE)
    };
    let (desc, _) = LayoutVerified::<_, Descriptor>::new_unaligned_from_prefix(bytes)
        .expect("slice is exactly DESCRIPTOR_SIZE bytes");
    *desc
}

/// Walks the descriptor chain starting at `head` in `desc_table`
/// (which has `outer_qsz` entries), resolving each buffer through
/// `mmap`, and returns the assembled [`Iov`].
///
/// Implements §4.C's five rules in order: head bounds, conflicting
/// flags, indirect table validation (including the "no nested
/// indirect" rule), loop detection by domain-sized visit count, and
/// per-descriptor translation/zero-length checks. Returns on the first
/// violation without touching the used ring; the caller decides how to
/// recover (§7: any error here is `ProtocolError`, fatal to the queue).
pub fn walk_chain(
    mmap: &MemoryMap,
    desc_table: &HostPtr,
    head: u16,
    outer_qsz: u16,
    max_iov: usize,
) -> Result<Iov, Error> {
    if head as usize >= outer_qsz as usize {
        return Err(ProtocolError::IndexOutOfRange {
            index: head as usize,
            domain: outer_qsz as usize,
        }
        .into());
    }

    let mut builder = IovBuilder::new(head, max_iov);

    let mut table = desc_table.clone();
    let mut domain = outer_qsz as usize;
    let mut idx = head as usize;
    let mut visited = 0usize;
    let mut entered_indirect = false;

    loop {
        if visited >= domain {
            return Err(ProtocolError::Loop { limit: domain }.into());
        }
        visited += 1;

        let desc = read_descriptor(&table, idx);
        let flags = desc.flags();

        if flags.contains(DescFlags::NEXT) && flags.contains(DescFlags::INDIRECT) {
            return Err(ProtocolError::ConflictingFlags { index: idx }.into());
        }

        if flags.contains(DescFlags::INDIRECT) {
            if entered_indirect {
                return Err(ProtocolError::NestedIndirect.into());
            }
            if desc.len == 0 || desc.len as usize % DESCRIPTOR_SIZE != 0 {
                return Err(ProtocolError::BadIndirectTableSize {
                    index: idx,
                    len: desc.len,
                    desc_size: DESCRIPTOR_SIZE,
                }
                .into());
            }
            let indirect_table = mmap
                .translate(desc.addr, desc.len as usize)
                .ok_or(crate::error::TranslationError {
                    gpa: desc.addr,
                    gpa_end: desc.addr + desc.len as u64,
                })?;

            table = indirect_table;
            domain = desc.len as usize / DESCRIPTOR_SIZE;
            idx = 0;
            visited = 0;
            entered_indirect = true;
            continue;
        }

        if desc.len == 0 {
            return Err(ProtocolError::ZeroLength { index: idx }.into());
        }

        let host = mmap
            .translate(desc.addr, desc.len as usize)
            .ok_or(crate::error::TranslationError {
                gpa: desc.addr,
                gpa_end: desc.addr + desc.len as u64,
            })?;
        builder.push(host, flags.contains(DescFlags::WRITE))?;

        if !flags.contains(DescFlags::NEXT) {
            break;
        }
        if desc.next as usize >= domain {
            return Err(ProtocolError::IndexOutOfRange {
                index: desc.next as usize,
                domain,
            }
            .into());
        }
        idx = desc.next as usize;
    }

    Ok(builder.finish())
}
