//! The arena module.
//!
//! Adapted from the teacher's `kernel-aam` arena module: a homogeneous
//! store that hands out thread-safe, reference-counted handles to its
//! entries. The kernel version hand-rolls an intrusive free list because
//! it has no heap allocator it is willing to trust on a hot path; a
//! vhost-user backend runs in userspace with a real allocator, so
//! [`RegionArena`] is a thin wrapper around [`Arc`] bookkeeping instead.
//!
//! The one invariant that does carry over unchanged: a handle obtained
//! from the arena keeps its underlying data alive for as long as the
//! handle exists, independent of when the arena itself retires the
//! entry. That is what lets a [`Region`] returned from a memory-region
//! registry outlive an unmap that races with an in-flight descriptor
//! chain walk.

use std::sync::{Arc, RwLock};

/// A single entry owned by a [`RegionArena`].
#[derive(Debug)]
pub struct Region<T> {
    data: T,
}

impl<T> Region<T> {
    fn new(data: T) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &T {
        &self.data
    }
}

/// A homogeneous, thread-safe store of [`Region`]s.
///
/// Unlike the teacher's `Arena`, entries are never reused in place:
/// registering a region allocates a fresh `Arc`, and retiring a region
/// only drops the arena's own reference. A caller that cloned the `Arc`
/// out earlier keeps the region alive until it drops its own handle.
/// This matches vhost-user `SET_MEM_TABLE` semantics, where a region can
/// be unmapped while an in-flight IOV still holds translated pointers
/// into it.
pub struct RegionArena<T> {
    regions: RwLock<Vec<Arc<Region<T>>>>,
}

impl<T> Default for RegionArena<T> {
    fn default() -> Self {
        Self {
            regions: RwLock::new(Vec::new()),
        }
    }
}

impl<T> RegionArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new region and returns a handle pinning it alive.
    pub fn insert(&self, data: T) -> Arc<Region<T>> {
        let region = Arc::new(Region::new(data));
        self.regions
            .write()
            .expect("region arena lock poisoned")
            .push(Arc::clone(&region));
        region
    }

    /// Retires every registered region for which `pred` returns `true`.
    /// Handles already cloned out by callers are unaffected.
    pub fn retain<F: FnMut(&T) -> bool>(&self, mut pred: F) {
        self.regions
            .write()
            .expect("region arena lock poisoned")
            .retain(|r| pred(r.data()));
    }

    /// Returns the first registered region for which `pred` returns
    /// `true`, cloning out a handle that keeps it alive.
    pub fn find<F: Fn(&T) -> bool>(&self, pred: F) -> Option<Arc<Region<T>>> {
        self.regions
            .read()
            .expect("region arena lock poisoned")
            .iter()
            .find(|r| pred(r.data()))
            .cloned()
    }

    /// A snapshot of the currently registered regions.
    pub fn snapshot(&self) -> Vec<Arc<Region<T>>> {
        self.regions
            .read()
            .expect("region arena lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.regions
            .read()
            .expect("region arena lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
