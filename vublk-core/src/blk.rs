//! The virtio-blk request parser/dispatcher (§4.F): binds a validated
//! descriptor chain to a block-I/O request, hands it to an injected
//! backend, and writes the status byte on completion.
//!
//! Grounded on `virtio_blk_test.cpp`'s `bdev_request`/`test_bdev`
//! harness: the exact split between framing failures (status left
//! untouched, chain still freed with `len=0`) and semantic failures
//! (status forced to `IOERR`) comes from `empty_request_test`,
//! `oob_request_test`, and `bad_request_layout_test` there.

use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::{FramingError, SemanticError};
use crate::iov::Iov;

/// `req_hdr.type` values (§4.F rule 2). `Discard`/`WriteZeroes` are
/// carried over from the original source's request set; unlike
/// `In`/`Out` their data segment is an array of [`DiscardSegment`]
/// structs, not raw payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    In = 0,
    Out = 1,
    Flush = 4,
    GetId = 8,
    Discard = 11,
    WriteZeroes = 13,
}

impl RequestType {
    fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::In,
            1 => Self::Out,
            4 => Self::Flush,
            8 => Self::GetId,
            11 => Self::Discard,
            13 => Self::WriteZeroes,
            _ => return None,
        })
    }
}

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;

const DISK_ID_LEN: usize = 20;

/// The wire header at the front of every virtio-blk request.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned, Default)]
#[repr(C)]
pub struct RequestHeader {
    pub req_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

const REQUEST_HEADER_SIZE: usize = std::mem::size_of::<RequestHeader>();
static_assertions::const_assert_eq!(REQUEST_HEADER_SIZE, 16);

/// One `virtio_blk_discard_write_zeroes` segment (§4.F): `DISCARD` and
/// `WRITE_ZEROES` carry an array of these in place of a raw payload,
/// exactly one per data buffer.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned, Default)]
#[repr(C)]
pub struct DiscardSegment {
    pub sector: u64,
    pub num_sectors: u32,
    pub flags: u32,
}

const DISCARD_SEGMENT_SIZE: usize = std::mem::size_of::<DiscardSegment>();
static_assertions::const_assert_eq!(DISCARD_SEGMENT_SIZE, 16);

/// A parsed, semantically-valid request ready for the backend.
pub struct Bio {
    pub kind: BioKind,
    pub first_sector: u64,
    pub total_sectors: u64,
    /// The full chain: header descriptor, data descriptors, and the
    /// status descriptor, in that order. Kept whole rather than
    /// sliced down to the data segment because the completion path
    /// needs the status descriptor back to call [`write_status`].
    /// Backends index `iov.entries()[1..iov.entries().len() - 1]` for
    /// the data buffers.
    pub iov: Iov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioKind {
    Read,
    Write,
    GetId,
    Flush,
    Discard,
    WriteZeroes,
}

/// Outcome of validating one chain: either a request ready for the
/// backend, or a locally-recovered failure that the caller commits
/// immediately without ever touching the backend.
pub enum Dispatch {
    Submit(Bio),
    /// Framing was invalid: commit with `len=0`, status untouched.
    /// Carries the chain back so the caller can still free it.
    FramingFailed(Iov),
    /// Framing was valid but semantics were not: commit with `len=0`,
    /// status forced to `IOERR`. Carries the chain back so the caller
    /// can write the status byte before freeing it.
    SemanticFailed(Iov),
}

/// Validates one descriptor chain against the virtio-blk request
/// layout (§4.F rules 1-6) and either produces a `Bio` or reports
/// which recovery path the caller must take.
pub fn validate_request(iov: Iov, block_size: u32, capacity_sectors: u64) -> Dispatch {
    let entries = iov.entries();

    if entries.len() < 3 {
        log::warn!(
            "{}",
            FramingError::TooFewDescriptors { nvecs: entries.len() }
        );
        return Dispatch::FramingFailed(iov);
    }

    let header_entry = &entries[0];
    if header_entry.writable || header_entry.host.len() < REQUEST_HEADER_SIZE {
        log::warn!(
            "{}",
            FramingError::BadHeaderDescriptor {
                len: header_entry.host.len() as u64,
                min: REQUEST_HEADER_SIZE,
            }
        );
        return Dispatch::FramingFailed(iov);
    }

    let status_entry = &entries[entries.len() - 1];
    if !status_entry.writable || status_entry.host.len() != 1 {
        log::warn!(
            "{}",
            FramingError::BadStatusDescriptor {
                len: status_entry.host.len() as u64,
            }
        );
        return Dispatch::FramingFailed(iov);
    }

    // Framing is valid from here on: every further rejection is
    // semantic and commits with status = IOERR rather than untouched.
    let header = read_header(header_entry);
    let req_type = match RequestType::from_wire(header.req_type) {
        Some(t) => t,
        None => return semantic_failure(iov, SemanticError::UnknownRequestType(header.req_type)),
    };

    let data_range = 1..entries.len() - 1;

    match req_type {
        RequestType::In | RequestType::GetId => {
            if entries[data_range.clone()].iter().any(|e| !e.writable) {
                return semantic_failure(iov, SemanticError::WrongBufferDirection(req_type));
            }
        }
        RequestType::Out | RequestType::Discard | RequestType::WriteZeroes => {
            if entries[data_range.clone()].iter().any(|e| e.writable) {
                return semantic_failure(iov, SemanticError::WrongBufferDirection(req_type));
            }
        }
        RequestType::Flush => {
            if !data_range.is_empty() {
                return semantic_failure(
                    iov,
                    SemanticError::UnexpectedFlushPayload(data_range.len()),
                );
            }
        }
    }

    if req_type == RequestType::GetId {
        let total: u64 = entries[data_range].iter().map(|e| e.host.len() as u64).sum();
        if total != DISK_ID_LEN as u64 {
            return semantic_failure(
                iov,
                SemanticError::BadDiskIdLength {
                    got: total,
                    want: DISK_ID_LEN,
                },
            );
        }
        return Dispatch::Submit(Bio {
            kind: BioKind::GetId,
            first_sector: 0,
            total_sectors: 0,
            iov,
        });
    }

    if req_type == RequestType::Flush {
        return Dispatch::Submit(Bio {
            kind: BioKind::Flush,
            first_sector: header.sector,
            total_sectors: 0,
            iov,
        });
    }

    if matches!(req_type, RequestType::Discard | RequestType::WriteZeroes) {
        return validate_discard_write_zeroes(iov, req_type, data_range.clone(), capacity_sectors);
    }

    for e in &entries[data_range.clone()] {
        let len = e.host.len() as u64;
        if len == 0 || len % block_size as u64 != 0 {
            return semantic_failure(iov, SemanticError::MisalignedBuffer { len, block_size });
        }
    }

    const SECTOR_SIZE: u64 = 512;
    let total_bytes: u64 = entries[data_range].iter().map(|e| e.host.len() as u64).sum();
    let total_sectors = total_bytes / SECTOR_SIZE;
    let first_sector = header.sector;

    if total_sectors == 0 {
        return semantic_failure(iov, SemanticError::ZeroLengthTransfer);
    }
    let last = match first_sector.checked_add(total_sectors) {
        Some(last) if last <= capacity_sectors => last,
        _ => {
            return semantic_failure(
                iov,
                SemanticError::OutOfRange {
                    first: first_sector,
                    count: total_sectors,
                    capacity: capacity_sectors,
                },
            )
        }
    };
    let _ = last;

    let kind = match req_type {
        RequestType::In => BioKind::Read,
        RequestType::Out => BioKind::Write,
        RequestType::Discard | RequestType::WriteZeroes | RequestType::GetId | RequestType::Flush => {
            unreachable!("handled above")
        }
    };

    Dispatch::Submit(Bio {
        kind,
        first_sector,
        total_sectors,
        iov,
    })
}

/// Validates the `DISCARD`/`WRITE_ZEROES` data segment (§4.F [ADDED]):
/// each data buffer must hold exactly one 16-byte
/// `virtio_blk_discard_write_zeroes` struct, not raw payload bytes.
/// Direction and framing were already checked by the caller.
fn validate_discard_write_zeroes(
    iov: Iov,
    req_type: RequestType,
    data_range: std::ops::Range<usize>,
    capacity_sectors: u64,
) -> Dispatch {
    let mut first_sector = None;
    let mut total_sectors: u64 = 0;

    for e in &iov.entries()[data_range.clone()] {
        let len = e.host.len() as u64;
        if len != DISCARD_SEGMENT_SIZE as u64 {
            return semantic_failure(
                iov,
                SemanticError::BadDiscardSegmentLength {
                    len,
                    want: DISCARD_SEGMENT_SIZE,
                },
            );
        }
        let segment = read_discard_segment(e);
        match segment.sector.checked_add(segment.num_sectors as u64) {
            Some(last) if last <= capacity_sectors => {}
            _ => {
                return semantic_failure(
                    iov,
                    SemanticError::DiscardSegmentOutOfRange {
                        first: segment.sector,
                        count: segment.num_sectors as u64,
                        capacity: capacity_sectors,
                    },
                )
            }
        }
        first_sector.get_or_insert(segment.sector);
        total_sectors += segment.num_sectors as u64;
    }

    let kind = if req_type == RequestType::Discard {
        BioKind::Discard
    } else {
        BioKind::WriteZeroes
    };

    Dispatch::Submit(Bio {
        kind,
        first_sector: first_sector.unwrap_or(0),
        total_sectors,
        iov,
    })
}

fn semantic_failure(iov: Iov, cause: SemanticError) -> Dispatch {
    log::warn!("virtio-blk request rejected: {}", cause);
    Dispatch::SemanticFailed(iov)
}

fn read_header(entry: &crate::iov::IovEntry) -> RequestHeader {
    // SAFETY: framing already checked `entry.host.len() >=
    // REQUEST_HEADER_SIZE`.
    let bytes = unsafe { std::slice::from_raw_parts(entry.host.as_ptr(), REQUEST_HEADER_SIZE) };
    let (header, _) = zerocopy::LayoutVerified::<_, RequestHeader>::new_unaligned_from_prefix(bytes)
        .expect("slice is exactly REQUEST_HEADER_SIZE bytes");
    *header
}

fn read_discard_segment(entry: &crate::iov::IovEntry) -> DiscardSegment {
    // SAFETY: caller already checked entry.host.len() ==
    // DISCARD_SEGMENT_SIZE.
    let bytes = unsafe { std::slice::from_raw_parts(entry.host.as_ptr(), DISCARD_SEGMENT_SIZE) };
    let (segment, _) = zerocopy::LayoutVerified::<_, DiscardSegment>::new_unaligned_from_prefix(bytes)
        .expect("slice is exactly DISCARD_SEGMENT_SIZE bytes");
    *segment
}

/// Writes `status` into the last entry of `iov` — the single-byte
/// status descriptor every admitted chain carries. Not called at all
/// on the framing-failure path (§4.F: "status byte left untouched").
pub fn write_status(iov: &Iov, status: u8) {
    let entries = iov.entries();
    let status_entry = &entries[entries.len() - 1];
    unsafe { std::ptr::write_volatile(status_entry.host.as_ptr(), status) };
}
