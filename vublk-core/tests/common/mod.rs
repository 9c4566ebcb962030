//! Shared test harness for the virtqueue integration tests, modeled
//! on `qdata.h`'s `queue_data`/`desc_chain` builders: a single
//! contiguous guest memory buffer carved into a descriptor table,
//! avail ring, used ring, and a data area, plus helpers to publish
//! avail entries and read back used entries.

#![allow(dead_code)]

use std::sync::Arc;

use vublk_core::descriptor::{Descriptor, DescFlags, DESCRIPTOR_SIZE, UsedElem};
use vublk_core::inflight::InflightRegion;
use vublk_core::memmap::MemoryMap;
use vublk_core::virtqueue::Virtqueue;
use zerocopy::AsBytes;

pub const GPA_BASE: u64 = 0x1_0000;
const AVAIL_HDR: usize = 4;
const USED_HDR: usize = 4;
const DATA_AREA_SIZE: usize = 64 * 1024;

pub struct TestQueue {
    backing: Box<[u8]>,
    mmap: Arc<MemoryMap>,
    pub qsz: u16,
    pub desc_gpa: u64,
    pub avail_gpa: u64,
    pub used_gpa: u64,
    data_gpa: u64,
    data_cursor: usize,
}

impl TestQueue {
    pub fn new(qsz: u16) -> Self {
        let desc_table_size = qsz as usize * DESCRIPTOR_SIZE;
        let avail_size = AVAIL_HDR + qsz as usize * 2;
        let used_size = USED_HDR + qsz as usize * std::mem::size_of::<UsedElem>();
        let total = desc_table_size + avail_size + used_size + DATA_AREA_SIZE;

        let mut backing = vec![0u8; total].into_boxed_slice();
        let mmap = Arc::new(MemoryMap::new());
        unsafe { mmap.map_region(GPA_BASE, total, backing.as_mut_ptr()) };

        let desc_gpa = GPA_BASE;
        let avail_gpa = desc_gpa + desc_table_size as u64;
        let used_gpa = avail_gpa + avail_size as u64;
        let data_gpa = used_gpa + used_size as u64;

        Self {
            backing,
            mmap,
            qsz,
            desc_gpa,
            avail_gpa,
            used_gpa,
            data_gpa,
            data_cursor: 0,
        }
    }

    fn off(&self, gpa: u64) -> usize {
        (gpa - GPA_BASE) as usize
    }

    pub fn mmap(&self) -> Arc<MemoryMap> {
        Arc::clone(&self.mmap)
    }

    /// Carves `len` fresh bytes out of the data area and returns their GPA.
    pub fn alloc_data(&mut self, len: usize) -> u64 {
        let gpa = self.data_gpa + self.data_cursor as u64;
        self.data_cursor += len;
        assert!(self.data_cursor <= DATA_AREA_SIZE, "test data area exhausted");
        gpa
    }

    pub fn write_data(&mut self, gpa: u64, bytes: &[u8]) {
        let off = self.off(gpa);
        self.backing[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_data(&self, gpa: u64, len: usize) -> &[u8] {
        let off = self.off(gpa);
        &self.backing[off..off + len]
    }

    pub fn write_descriptor(&mut self, table_gpa: u64, idx: u16, desc: Descriptor) {
        let off = self.off(table_gpa) + idx as usize * DESCRIPTOR_SIZE;
        self.backing[off..off + DESCRIPTOR_SIZE].copy_from_slice(desc.as_bytes());
    }

    pub fn write_desc(&mut self, idx: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        self.write_descriptor(
            self.desc_gpa,
            idx,
            Descriptor {
                addr,
                len,
                flags: flags.bits(),
                next,
            },
        );
    }

    /// Allocates a fresh indirect table of `n` descriptors and returns its GPA.
    pub fn alloc_indirect_table(&mut self, n: usize) -> u64 {
        self.alloc_data(n * DESCRIPTOR_SIZE)
    }

    pub fn write_indirect_desc(&mut self, table_gpa: u64, idx: u16, desc: Descriptor) {
        self.write_descriptor(table_gpa, idx, desc);
    }

    pub fn set_avail_idx(&mut self, idx: u16) {
        let off = self.off(self.avail_gpa);
        self.backing[off + 2..off + 4].copy_from_slice(&idx.to_ne_bytes());
    }

    pub fn read_avail_idx(&self) -> u16 {
        let off = self.off(self.avail_gpa);
        u16::from_ne_bytes(self.backing[off + 2..off + 4].try_into().unwrap())
    }

    pub fn set_avail_entry(&mut self, slot: u16, head: u16) {
        let off = self.off(self.avail_gpa) + AVAIL_HDR + slot as usize * 2;
        self.backing[off..off + 2].copy_from_slice(&head.to_ne_bytes());
    }

    /// Publishes `heads` starting at avail slot 0 and bumps `avail.idx`
    /// to `heads.len()` — the common case for these tests, which never
    /// wrap the ring.
    pub fn publish_avail(&mut self, heads: &[u16]) {
        for (slot, &head) in heads.iter().enumerate() {
            self.set_avail_entry(slot as u16, head);
        }
        self.set_avail_idx(heads.len() as u16);
    }

    pub fn read_used_idx(&self) -> u16 {
        let off = self.off(self.used_gpa);
        u16::from_ne_bytes(self.backing[off + 2..off + 4].try_into().unwrap())
    }

    pub fn read_used_entry(&self, slot: u16) -> UsedElem {
        let off = self.off(self.used_gpa) + USED_HDR + slot as usize * std::mem::size_of::<UsedElem>();
        UsedElem {
            id: u32::from_ne_bytes(self.backing[off..off + 4].try_into().unwrap()),
            len: u32::from_ne_bytes(self.backing[off + 4..off + 8].try_into().unwrap()),
        }
    }

    /// Writes a used-ring entry directly, bypassing `Virtqueue`. Used
    /// only to hand-simulate a torn commit (guest-side steps done,
    /// inflight-region-side steps not yet) ahead of a repair test.
    pub fn write_used_entry(&mut self, slot: u16, elem: UsedElem) {
        let off = self.off(self.used_gpa) + USED_HDR + slot as usize * std::mem::size_of::<UsedElem>();
        self.backing[off..off + 4].copy_from_slice(&elem.id.to_ne_bytes());
        self.backing[off + 4..off + 8].copy_from_slice(&elem.len.to_ne_bytes());
    }

    pub fn set_used_idx(&mut self, idx: u16) {
        let off = self.off(self.used_gpa);
        self.backing[off + 2..off + 4].copy_from_slice(&idx.to_ne_bytes());
    }

    pub fn inflight(&self) -> InflightRegion {
        let file = tempfile::tempfile().expect("tempfile");
        InflightRegion::create_on(&file, self.qsz as usize).expect("create inflight region")
    }

    /// Binds a `Virtqueue` to this harness's guest memory. Borrows
    /// rather than consumes `self`: the returned queue holds raw
    /// pointers into `self.backing`, so the harness must outlive it,
    /// but the harness still needs `&mut self` afterwards to publish
    /// more avail entries and read back used entries.
    pub fn make_virtqueue(&self, inflight: InflightRegion) -> Virtqueue {
        Virtqueue::init(
            self.mmap(),
            self.qsz,
            self.desc_gpa,
            self.avail_gpa,
            self.used_gpa,
            inflight,
        )
        .expect("virtqueue init")
    }
}
