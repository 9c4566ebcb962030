//! The public facade (§4.G, §6): registers a block device on a
//! virtqueue and exposes the four backend-facing calls. No global
//! state — every call takes an explicit handle (§9 "No global
//! state").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::blk::{self, Bio, Dispatch, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK};
use crate::config::BlockDevConfig;
use crate::error::Error;
use crate::iov::Iov;
use crate::virtqueue::Virtqueue;

/// A one-shot completion channel for a single [`Bio`] (§5
/// "Cancellation & completion handlers"): the backend calls
/// [`Self::complete`] exactly once, from any thread, and this writes
/// the status byte and pushes the chain.
pub struct CompletionToken<U> {
    iov: Mutex<Option<Iov>>,
    completed: AtomicBool,
    device: Arc<BlockDeviceInner<U>>,
}

impl<U> CompletionToken<U> {
    /// Reports the outcome of a previously dequeued request. Panics
    /// if called more than once for the same token — that is a
    /// backend bug, not a recoverable protocol condition (§5 "clear
    /// completed exactly once semantics enforced by the type
    /// system").
    pub fn complete(&self, status: BioStatus) {
        let already_completed = self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        assert!(!already_completed, "CompletionToken::complete called more than once");
        let iov = self
            .iov
            .lock()
            .expect("completion token lock poisoned")
            .take()
            .expect("completion token iov missing despite first completion");

        let status_byte = match status {
            BioStatus::Ok => VIRTIO_BLK_S_OK,
            BioStatus::IoError => VIRTIO_BLK_S_IOERR,
        };
        blk::write_status(&iov, status_byte);

        let mut vq = self.device.queue.lock().expect("queue lock poisoned");
        // virtio-blk completions always push a used length of 0 — the
        // status byte carries the outcome, not the used-ring `len`
        // field. A push error here means the queue broke between
        // dequeue and this completion; the backend already ran the
        // I/O and there is nothing further to undo.
        let _ = vq.push(iov, 0);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BioStatus {
    Ok,
    IoError,
}

struct BlockDeviceInner<U> {
    queue: Mutex<Virtqueue>,
    config: BlockDevConfig,
    userdata: U,
}

/// A registered virtio-blk device bound to one virtqueue. `U` is the
/// caller's opaque context, threaded through exactly as the external
/// interface's `userdata` parameter (§6) — this engine never
/// interprets it.
pub struct BlockDevice<U> {
    inner: Arc<BlockDeviceInner<U>>,
}

impl<U> BlockDevice<U> {
    pub fn userdata(&self) -> &U {
        &self.inner.userdata
    }
}

/// Registers a device servicing `queue` under `config`, tagged with
/// caller-owned `userdata` (§6 `register_blockdev`).
pub fn register_blockdev<U>(config: BlockDevConfig, queue: Virtqueue, userdata: U) -> BlockDevice<U> {
    BlockDevice {
        inner: Arc::new(BlockDeviceInner {
            queue: Mutex::new(queue),
            config,
            userdata,
        }),
    }
}

/// Drains outstanding work and releases the underlying virtqueue.
/// `notify_cb` fires only once every outstanding [`CompletionToken`]
/// has dropped its share of the device — i.e. once every dequeued
/// request has actually completed — matching §6's "drains outstanding
/// IOVs then invokes `notify_cb`" contract.
pub fn unregister_blockdev<U>(device: BlockDevice<U>, notify_cb: impl FnOnce()) {
    let mut inner = device.inner;
    let inner = loop {
        match Arc::try_unwrap(inner) {
            Ok(inner) => break inner,
            Err(shared) => {
                // A CompletionToken still holds a reference; spin
                // until the backend finishes it and drops its share.
                // No global state is held across the yield (§9), just
                // this function's own local `Arc`.
                inner = shared;
                std::thread::yield_now();
            }
        }
    };
    inner
        .queue
        .into_inner()
        .expect("queue lock poisoned")
        .release();
    notify_cb();
}

/// Pulls and validates one request from the device's queue (§6
/// `dequeue_request`). Framing and semantic failures are resolved
/// immediately against the used ring and never reach the caller;
/// `Ok(None)` means no request is ready, `Err` means the queue broke.
pub fn dequeue_request<U>(device: &BlockDevice<U>) -> Result<Option<(Bio, Arc<CompletionToken<U>>)>, Error> {
    let mut vq = device.inner.queue.lock().expect("queue lock poisoned");

    let Some(iov) = vq.dequeue_one()? else {
        return Ok(None);
    };

    match blk::validate_request(
        iov,
        device.inner.config.block_size(),
        device.inner.config.capacity_sectors(),
    ) {
        Dispatch::Submit(bio) => {
            drop(vq);
            let token_iov = bio.iov.clone();
            let token = Arc::new(CompletionToken {
                iov: Mutex::new(Some(token_iov)),
                completed: AtomicBool::new(false),
                device: Arc::clone(&device.inner),
            });
            Ok(Some((bio, token)))
        }
        Dispatch::FramingFailed(iov) => {
            vq.push(iov, 0)?;
            Ok(None)
        }
        Dispatch::SemanticFailed(iov) => {
            blk::write_status(&iov, VIRTIO_BLK_S_IOERR);
            vq.push(iov, 0)?;
            Ok(None)
        }
    }
}
