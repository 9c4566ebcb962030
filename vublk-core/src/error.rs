//! Error taxonomy (§7).
//!
//! Every fallible engine operation returns `Result<T, Error>`. The
//! outer `Error` groups causes into the kinds §7 assigns a recovery
//! policy to: `Protocol` and `Translation` break the queue sticky,
//! `Framing` and `Semantic` are recovered per-request, `Backend`
//! surfaces as a virtio-blk status code, and `Resource` is treated as
//! `Protocol` for recovery purposes.

use std::io;

use crate::blk::RequestType;

/// Malformed descriptor chain, bad indirect table, loop, or
/// conflicting flags (§4.C). Fatal to the queue.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("descriptor index {index} is out of range for a domain of {domain} entries")]
    IndexOutOfRange { index: usize, domain: usize },
    #[error("descriptor {index} has both NEXT and INDIRECT flags set")]
    ConflictingFlags { index: usize },
    #[error("descriptor {index} has zero length")]
    ZeroLength { index: usize },
    #[error("indirect descriptor {index} has table length {len}, which is not a nonzero multiple of {desc_size}")]
    BadIndirectTableSize {
        index: usize,
        len: u32,
        desc_size: usize,
    },
    #[error("indirect descriptor found nested inside an indirect table")]
    NestedIndirect,
    #[error("descriptor chain exceeds its domain of {limit} entries (loop suspected)")]
    Loop { limit: usize },
}

/// A guest physical range does not translate to mapped host memory
/// (§4.A). Fatal to the queue, same effect as `Protocol`.
#[derive(Debug, thiserror::Error)]
#[error("guest range [{gpa:#x}, {gpa_end:#x}) is not contained in any registered region")]
pub struct TranslationError {
    pub gpa: u64,
    pub gpa_end: u64,
}

/// Allocating an IOV entry failed (§4.B `TooLong`). Fatal to the
/// queue; recovered the same way as `Protocol`.
#[derive(Debug, thiserror::Error)]
#[error("descriptor chain of {len} entries exceeds the queue's IOV capacity of {max}")]
pub struct ResourceError {
    pub len: usize,
    pub max: usize,
}

/// The virtio-blk request layout itself is invalid: wrong header or
/// status descriptor size, missing segments (§4.F rule 1). Recovered
/// locally — the chain is committed with `len = 0` and the status byte
/// is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("descriptor chain has only {nvecs} entries, need at least 3")]
    TooFewDescriptors { nvecs: usize },
    #[error("first descriptor is {len} bytes (need >= {min}) or is not device-readable")]
    BadHeaderDescriptor { len: u64, min: usize },
    #[error("last descriptor is {len} bytes (need exactly 1) or is not device-writable")]
    BadStatusDescriptor { len: u64 },
}

/// Framing was valid but the request's parameters are not: OOB
/// sector, zero-length transfer, wrong buffer direction for the
/// opcode (§4.F rules 2–6). Recovered locally with status `IOERR`.
#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("unknown virtio-blk request type {0:#x}")]
    UnknownRequestType(u32),
    #[error("data buffer direction does not match request type {0:?}")]
    WrongBufferDirection(RequestType),
    #[error("data buffer length {len} is not a nonzero multiple of the logical block size {block_size}")]
    MisalignedBuffer { len: u64, block_size: u32 },
    #[error("request covers zero sectors")]
    ZeroLengthTransfer,
    #[error("sector range [{first}, {first}+{count}) exceeds device capacity of {capacity} sectors")]
    OutOfRange { first: u64, count: u64, capacity: u64 },
    #[error("GET_ID data buffer is {got} bytes, need exactly {want}")]
    BadDiskIdLength { got: u64, want: usize },
    #[error("FLUSH request carries {0} data buffers, expected 0")]
    UnexpectedFlushPayload(usize),
    #[error("discard/write-zeroes data buffer is {len} bytes, need exactly {want}")]
    BadDiscardSegmentLength { len: u64, want: usize },
    #[error("discard/write-zeroes segment [{first}, {first}+{count}) exceeds device capacity of {capacity} sectors")]
    DiscardSegmentOutOfRange { first: u64, count: u64, capacity: u64 },
}

/// The full error type returned by this crate's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("translation failure: {0}")]
    Translation(#[from] TranslationError),
    #[error("resource exhausted: {0}")]
    Resource(#[from] ResourceError),
    #[error("malformed virtio-blk request framing: {0}")]
    Framing(#[from] FramingError),
    #[error("invalid virtio-blk request semantics: {0}")]
    Semantic(#[from] SemanticError),
    #[error("backend I/O failure: {0}")]
    Backend(#[from] io::Error),
    #[error("queue is broken and rejects further operations")]
    QueueBroken,
}

impl Error {
    /// Whether this error is fatal to the owning queue per §7's
    /// propagation policy, as opposed to one recovered per-request
    /// (`Framing`, `Semantic`) or surfaced to the backend (`Backend`).
    pub fn is_fatal_to_queue(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Translation(_) | Error::Resource(_) | Error::QueueBroken
        )
    }
}
