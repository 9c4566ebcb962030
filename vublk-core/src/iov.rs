//! The resolved scatter-gather list produced by walking a descriptor
//! chain (§4.B).

use crate::error::{Error, ResourceError};
use crate::memmap::HostPtr;

/// One resolved buffer in an [`Iov`]: a host pointer plus the
/// direction the guest granted the device (`writable` == the
/// descriptor carried `DescFlags::WRITE`, i.e. the device may write
/// into it).
#[derive(Clone)]
pub struct IovEntry {
    pub host: HostPtr,
    pub writable: bool,
}

/// The fully-resolved form of a descriptor chain: the head index that
/// names it on the used ring, plus its buffers in chain order.
///
/// §4.B leaves mixed read/write ordering unrejected at this layer —
/// only [`crate::blk`] enforces the virtio-blk convention of
/// device-readable buffers before device-writable ones.
#[derive(Clone)]
pub struct Iov {
    head: u16,
    entries: Vec<IovEntry>,
    n_in: usize,
    n_out: usize,
}

impl Iov {
    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn entries(&self) -> &[IovEntry] {
        &self.entries
    }

    /// Number of device-writable buffers (descriptors with `WRITE` set).
    pub fn n_writable(&self) -> usize {
        self.n_in
    }

    /// Number of device-readable buffers (descriptors without `WRITE`).
    pub fn n_readable(&self) -> usize {
        self.n_out
    }

    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.host.len() as u64).sum()
    }
}

/// Accumulates descriptors for a single chain while the walker
/// traverses it. Capacity-checked against the queue's configured
/// `max_iov` so a pathological (but loop-free) chain cannot grow an
/// unbounded `Vec` (§4.B `TooLong`).
pub(crate) struct IovBuilder {
    head: u16,
    max_iov: usize,
    entries: Vec<IovEntry>,
    n_in: usize,
    n_out: usize,
}

impl IovBuilder {
    pub(crate) fn new(head: u16, max_iov: usize) -> Self {
        Self {
            head,
            max_iov,
            entries: Vec::new(),
            n_in: 0,
            n_out: 0,
        }
    }

    pub(crate) fn push(&mut self, host: HostPtr, writable: bool) -> Result<(), Error> {
        if self.entries.len() >= self.max_iov {
            return Err(ResourceError {
                len: self.entries.len() + 1,
                max: self.max_iov,
            }
            .into());
        }
        if writable {
            self.n_in += 1;
        } else {
            self.n_out += 1;
        }
        self.entries.push(IovEntry { host, writable });
        Ok(())
    }

    pub(crate) fn finish(self) -> Iov {
        Iov {
            head: self.head,
            entries: self.entries,
            n_in: self.n_in,
            n_out: self.n_out,
        }
    }
}
