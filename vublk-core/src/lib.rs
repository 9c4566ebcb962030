//! Split-virtqueue engine and virtio-blk dispatcher for a vhost-user
//! block backend.
//!
//! Layered leaf-first, matching the way each module is grounded
//! (see `DESIGN.md`):
//!
//! - [`memmap`] — guest physical to host pointer translation.
//! - [`descriptor`] — on-the-wire descriptor and ring layouts.
//! - [`iov`] — the resolved scatter-gather list.
//! - [`walker`] — turns an avail-ring head into a validated [`iov::Iov`].
//! - [`inflight`] — the crash-recoverable shadow region.
//! - [`virtqueue`] — glues the above into the dequeue/push state machine.
//! - [`blk`] — the virtio-blk request parser and dispatcher.
//! - [`device`] — the backend-facing registration facade.
//! - [`config`] — validated device/queue parameters.
//! - [`error`] — the crate's error taxonomy.

pub mod blk;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod inflight;
pub mod iov;
pub mod memmap;
pub mod virtqueue;
pub mod walker;

pub use error::Error;
