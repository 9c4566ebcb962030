//! The memory map (§4.A): translates a guest physical address range
//! into a host pointer, refcounted so a translation can outlive a
//! region remap.
//!
//! Built on [`vublk_arena::RegionArena`], adapted from the teacher's
//! `kernel-aam` arena the way the module doc there describes: a
//! homogeneous store handing out reference-counted handles. The
//! teacher hand-rolls that refcounting to work around `no_std`; here
//! we lean on `Arc` directly, which `RegionArena` already wraps.

use std::sync::Arc;

use vublk_arena::{Region, RegionArena};

/// A single region of guest memory registered with the device,
/// spanning `[gpa, gpa + len)` and backed by host memory starting at
/// `host_base`.
#[derive(Debug)]
struct GuestRegion {
    gpa: u64,
    len: usize,
    /// Stashed as `usize` rather than a raw pointer so `GuestRegion`
    /// stays trivially `Send + Sync` without an explicit unsafe impl.
    host_base: usize,
}

impl GuestRegion {
    fn contains(&self, gpa: u64, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        let Some(gpa_end) = gpa.checked_add(len as u64) else {
            return false;
        };
        let Some(region_end) = self.gpa.checked_add(self.len as u64) else {
            return false;
        };
        gpa >= self.gpa && gpa_end <= region_end
    }

    fn translate(&self, gpa: u64) -> *mut u8 {
        let offset = (gpa - self.gpa) as usize;
        // SAFETY: caller has already checked `self.contains(gpa, _)`,
        // so `offset` lies within `[0, self.len)`.
        unsafe { (self.host_base as *mut u8).add(offset) }
    }
}

/// A translated, live guest-physical range. Holds an `Arc` into the
/// owning region so the region cannot be freed out from under an
/// in-flight IOV, even if [`MemoryMap::unmap_region`] races with the
/// walk that produced this handle (§9 "cyclic references").
#[derive(Clone)]
pub struct HostPtr {
    region: Arc<Region<GuestRegion>>,
    ptr: usize,
    len: usize,
}

// SAFETY: `HostPtr` is a refcounted view over memory the caller owns
// under the single-writer-per-queue contract documented on
// `crate::virtqueue::Virtqueue`; it carries no interior mutability of
// its own.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-range `[offset, offset + len)` of this translation.
    /// Panics if the sub-range is not contained in `self`; callers are
    /// expected to have already checked bounds against a known struct
    /// layout.
    pub fn slice(&self, offset: usize, len: usize) -> HostPtr {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
        HostPtr {
            region: Arc::clone(&self.region),
            ptr: self.ptr + offset,
            len,
        }
    }
}

/// Translates guest physical addresses into host pointers. Refcounted
/// per region so a translation outlives a concurrent remap (§4.A).
#[derive(Default)]
pub struct MemoryMap {
    regions: RegionArena<GuestRegion>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `[gpa, gpa+len)` as backed by host memory starting at
    /// `host_base`. `host_base` must remain valid for as long as any
    /// [`HostPtr`] translated from this region is alive.
    ///
    /// # Safety
    ///
    /// `host_base` must point to at least `len` bytes of memory valid
    /// for the lifetime of this mapping.
    pub unsafe fn map_region(&self, gpa: u64, len: usize, host_base: *mut u8) {
        self.regions.insert(GuestRegion {
            gpa,
            len,
            host_base: host_base as usize,
        });
    }

    /// Retires the region starting at `gpa`. Already-issued [`HostPtr`]
    /// handles into it remain valid until dropped.
    pub fn unmap_region(&self, gpa: u64) {
        self.regions.retain(|r| r.gpa != gpa);
    }

    /// Translates `[gpa, gpa+len)` into a host pointer. Returns `None`
    /// when the range is not wholly contained in one registered region
    /// (§4.A) — the walker must reject any descriptor for which this
    /// happens.
    pub fn translate(&self, gpa: u64, len: usize) -> Option<HostPtr> {
        let region = self.regions.find(|r| r.contains(gpa, len))?;
        let ptr = region.data().translate(gpa) as usize;
        Some(HostPtr {
            region,
            ptr,
            len,
        })
    }
}
