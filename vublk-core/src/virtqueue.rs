//! The virtqueue state machine (§4.E): glues the memory map, walker,
//! and inflight region together into `dequeue_many`/`push`, and owns
//! the guest-visible avail/used ring access (acquire on the avail
//! index, release on the used index — §5 "Ordering").
//!
//! Grounded on `virtio_disk.rs`'s `rw()`/`intr()` pair: the teacher
//! publishes a chain with `fence(Ordering::SeqCst)` before bumping
//! `avail.idx` and drains the used ring on an interrupt. This module
//! is the device side of the same ring, so the fences move to the
//! opposite operations: acquire before trusting `avail.idx`, release
//! before the guest may trust `used.idx`.

use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::descriptor::UsedElem;
use crate::error::Error;
use crate::inflight::InflightRegion;
use crate::iov::Iov;
use crate::memmap::{HostPtr, MemoryMap};
use crate::walker::walk_chain;

/// What a [`Virtqueue::dequeue_many`] handler wants done with the
/// `Iov` it was just given.
pub enum HandlerAction {
    /// Publish immediately with this many bytes written.
    Commit { iov: Iov, bytes_written: u32 },
    /// The handler has taken ownership of the `Iov` and will call
    /// [`Virtqueue::push`] itself once its own async work completes.
    Deferred,
}

/// Lifecycle states (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Operational,
    Broken,
    Released,
}

/// One split virtqueue, bound to guest memory and a matching inflight
/// region. Single-writer from the device side (§4.E "Concurrency
/// contract"): callers must serialize calls to `&mut self` methods
/// themselves, e.g. one OS thread per queue.
pub struct Virtqueue {
    state: QueueState,
    qsz: u16,
    last_avail: u16,
    mmap: Arc<MemoryMap>,
    desc_table: HostPtr,
    avail: HostPtr,
    used: HostPtr,
    inflight: InflightRegion,
    max_iov: usize,
}

const AVAIL_HEADER_SIZE: usize = 4;
const USED_HEADER_SIZE: usize = 4;

fn read_used_entry_at(used: &HostPtr, slot: u16) -> UsedElem {
    let offset = USED_HEADER_SIZE + slot as usize * std::mem::size_of::<UsedElem>();
    // SAFETY: `slot < qsz` is checked by every call site, and `used`
    // covers `USED_HEADER_SIZE + qsz * size_of::<UsedElem>()` bytes.
    unsafe { ptr::read_volatile(used.as_ptr().add(offset) as *const UsedElem) }
}

impl Virtqueue {
    /// Binds a queue of `qsz` entries to the three guest-provided ring
    /// addresses and an inflight region, repairs any torn commit left
    /// by a prior crash, and transitions to `Operational`.
    ///
    /// `qsz` must be a power of two no greater than 32768 (§3). The
    /// IOV capacity is `qsz` plus one indirect table's worth of
    /// descriptors, per §4.B.
    pub fn init(
        mmap: Arc<MemoryMap>,
        qsz: u16,
        desc_gpa: u64,
        avail_gpa: u64,
        used_gpa: u64,
        mut inflight: InflightRegion,
    ) -> Result<Self, Error> {
        assert!(qsz > 0 && qsz.is_power_of_two() && qsz <= 32768, "qsz must be a power of two <= 32768");

        let desc_table = mmap
            .translate(desc_gpa, qsz as usize * crate::descriptor::DESCRIPTOR_SIZE)
            .ok_or(crate::error::TranslationError {
                gpa: desc_gpa,
                gpa_end: desc_gpa + (qsz as usize * crate::descriptor::DESCRIPTOR_SIZE) as u64,
            })?;
        let avail = mmap
            .translate(avail_gpa, AVAIL_HEADER_SIZE + qsz as usize * 2)
            .ok_or(crate::error::TranslationError {
                gpa: avail_gpa,
                gpa_end: avail_gpa + (AVAIL_HEADER_SIZE + qsz as usize * 2) as u64,
            })?;
        let used = mmap
            .translate(used_gpa, USED_HEADER_SIZE + qsz as usize * std::mem::size_of::<UsedElem>())
            .ok_or(crate::error::TranslationError {
                gpa: used_gpa,
                gpa_end: used_gpa
                    + (USED_HEADER_SIZE + qsz as usize * std::mem::size_of::<UsedElem>()) as u64,
            })?;

        let max_iov = qsz as usize + qsz as usize;

        let mut vq = Self {
            state: QueueState::Operational,
            qsz,
            last_avail: 0,
            mmap,
            desc_table,
            avail,
            used,
            inflight,
            max_iov,
        };

        let used_idx = vq.read_used_idx();
        vq.last_avail = used_idx;
        let used_ring = vq.used.clone();
        vq.inflight
            .repair(qsz, move |slot| read_used_entry_at(&used_ring, slot).id);
        Ok(vq)
    }

    pub fn is_broken(&self) -> bool {
        self.state == QueueState::Broken
    }

    /// Heads still recorded inflight after attach repair, in the
    /// order the guest originally submitted them (§4.D "Replay").
    /// Callers resubmit these before draining new avail entries.
    pub fn replay_order(&self) -> Vec<u16> {
        self.inflight.replay_order()
    }

    fn mark_broken(&mut self) {
        self.state = QueueState::Broken;
    }

    fn read_avail_idx(&self) -> u16 {
        // SAFETY: `self.avail` was translated for at least
        // `AVAIL_HEADER_SIZE` bytes in `init`.
        let idx = unsafe { ptr::read_volatile(self.avail.as_ptr().add(2) as *const u16) };
        fence(Ordering::Acquire);
        idx
    }

    fn read_avail_entry(&self, slot: u16) -> u16 {
        let offset = AVAIL_HEADER_SIZE + slot as usize * 2;
        // SAFETY: `slot < self.qsz` is checked by every call site, and
        // `self.avail` covers `AVAIL_HEADER_SIZE + qsz * 2` bytes.
        unsafe { ptr::read_volatile(self.avail.as_ptr().add(offset) as *const u16) }
    }

    fn read_used_idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used.as_ptr().add(2) as *const u16) }
    }

    fn write_used_entry(&self, slot: u16, elem: UsedElem) {
        let offset = USED_HEADER_SIZE + slot as usize * std::mem::size_of::<UsedElem>();
        unsafe { ptr::write_volatile(self.used.as_ptr().add(offset) as *mut UsedElem, elem) };
    }

    fn write_used_idx(&self, idx: u16) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.used.as_ptr().add(2) as *mut u16, idx) };
    }

    /// Pulls and walks at most one newly-available chain. Returns
    /// `Ok(None)` when `last_avail == avail.idx` (nothing new).
    /// Stamps the head inflight (§4.D "Dequeue") before walking it, so
    /// a walker failure still leaves an accurate inflight record for
    /// replay. On a walker error, marks the queue `Broken`.
    pub fn dequeue_one(&mut self) -> Result<Option<Iov>, Error> {
        if self.state != QueueState::Operational {
            return Err(Error::QueueBroken);
        }

        let avail_idx = self.read_avail_idx();
        if self.last_avail == avail_idx {
            return Ok(None);
        }

        let slot = self.last_avail % self.qsz;
        let head = self.read_avail_entry(slot);
        self.last_avail = self.last_avail.wrapping_add(1);

        self.inflight.stamp_inflight(head);

        match walk_chain(&self.mmap, &self.desc_table, head, self.qsz, self.max_iov) {
            Ok(iov) => Ok(Some(iov)),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Drains every newly-available chain via [`Self::dequeue_one`]
    /// and invokes `handler` for each. A handler returning
    /// `HandlerAction::Commit` is published on the used ring
    /// immediately, in the same call; `HandlerAction::Deferred` means
    /// the handler has taken ownership of the `Iov` and will call
    /// [`Self::push`] itself later. On any walker error or a
    /// `handler` error, marks the queue `Broken` and returns the
    /// error (§4.E).
    pub fn dequeue_many(
        &mut self,
        mut handler: impl FnMut(Iov) -> Result<HandlerAction, Error>,
    ) -> Result<(), Error> {
        loop {
            match self.dequeue_one()? {
                None => return Ok(()),
                Some(iov) => match handler(iov) {
                    Ok(HandlerAction::Commit { iov, bytes_written }) => {
                        self.commit(iov, bytes_written)
                    }
                    Ok(HandlerAction::Deferred) => {}
                    Err(e) => {
                        self.mark_broken();
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Publishes a completed chain on the used ring and clears its
    /// inflight bit (§4.D "Commit"). Exactly one `push` per dequeued
    /// `Iov`.
    pub fn push(&mut self, iov: Iov, bytes_written: u32) -> Result<(), Error> {
        if self.state != QueueState::Operational {
            return Err(Error::QueueBroken);
        }
        self.commit(iov, bytes_written);
        Ok(())
    }

    fn commit(&mut self, iov: Iov, bytes_written: u32) {
        let head = iov.head();
        drop(iov);

        let used_idx = self.read_used_idx();
        let slot = used_idx % self.qsz;
        self.write_used_entry(
            slot,
            UsedElem {
                id: head as u32,
                len: bytes_written,
            },
        );
        let new_used_idx = used_idx.wrapping_add(1);
        self.write_used_idx(new_used_idx);

        self.inflight.commit(head, new_used_idx);
    }

    /// Transitions to `Released`. Any chain dequeued but never pushed
    /// is simply dropped here without a used-ring entry; the inflight
    /// region still shows it pending, so a future reattach replays it
    /// (§5 "Cancellation").
    pub fn release(mut self) {
        self.state = QueueState::Released;
    }
}
