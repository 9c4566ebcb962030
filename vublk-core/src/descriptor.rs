//! On-the-wire virtqueue descriptor and ring layouts: the virtio 1.x
//! split layout (§3).
//!
//! Every type here is read directly out of untrusted guest memory by
//! [`crate::walker`] and [`crate::virtqueue`] via `zerocopy`. Nothing in
//! this module validates anything; it only describes the bytes. Fields
//! read through these types must be treated as adversarial input until
//! the walker has checked them (§9 "every field ... is untrusted and
//! must be validated on each access").

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, Unaligned};

bitflags! {
    /// Flags on a single [`Descriptor`]. `NEXT` and `INDIRECT` are
    /// mutually exclusive on the same descriptor (§3).
    pub struct DescFlags: u16 {
        const NEXT = 0x1;
        const WRITE = 0x2;
        const INDIRECT = 0x4;
    }
}

/// One `(addr, len, flags, next)` tuple describing a single buffer
/// (§3). 16 bytes, little-endian.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<Descriptor>();
static_assertions::const_assert_eq!(DESCRIPTOR_SIZE, 16);

impl Descriptor {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    pub fn has_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }
}

/// Header of the avail ring (§3): `flags`, producer `idx`. The
/// `ring[qsz]` array of head indices follows immediately in guest
/// memory and is not modeled as a Rust field, since `qsz` is a runtime
/// value.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned, Default)]
#[repr(C)]
pub struct AvailHeader {
    pub flags: u16,
    pub idx: u16,
}

/// Header of the used ring (§3): `flags`, producer `idx`. The
/// `ring[qsz]` array of [`UsedElem`] entries follows immediately.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned, Default)]
#[repr(C)]
pub struct UsedHeader {
    pub flags: u16,
    pub idx: u16,
}

/// One entry in the used ring: the head of a completed chain and the
/// number of bytes the device wrote into it.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AvailHeader>(), 4);
static_assertions::const_assert_eq!(std::mem::size_of::<UsedHeader>(), 4);
static_assertions::const_assert_eq!(std::mem::size_of::<UsedElem>(), 8);
