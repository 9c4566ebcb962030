//! Descriptor-chain and inflight-region integration tests, ported
//! from `virtq_test.cpp`'s scenario set (§8).

mod common;

use std::os::unix::fs::FileExt;

use common::TestQueue;
use vublk_core::descriptor::DescFlags;
use vublk_core::error::{Error, ProtocolError};

#[test]
fn direct_descriptors() {
    let mut tq = TestQueue::new(1024);
    let data_gpa = tq.alloc_data(0x1000);
    tq.write_desc(0, data_gpa, 0x1000, DescFlags::empty(), 0);
    tq.publish_avail(&[0]);

    let mut vq = tq.make_virtqueue(tq.inflight());
    let iov = vq.dequeue_one().unwrap().expect("chain available");
    assert_eq!(iov.entries().len(), 1);
    assert_eq!(iov.head(), 0);

    vq.push(iov, 42).unwrap();

    assert_eq!(tq.read_used_idx(), 1);
    let used = tq.read_used_entry(0);
    assert_eq!(used.id, 0);
    assert_eq!(used.len, 42);
    assert!(vq.replay_order().is_empty());
}

#[test]
fn indirect_descriptors_of_four() {
    let mut tq = TestQueue::new(1024);
    let table_gpa = tq.alloc_indirect_table(4);
    for i in 0..4u16 {
        let buf = tq.alloc_data(64);
        let next = if i + 1 < 4 { i + 1 } else { 0 };
        let flags = if i + 1 < 4 { DescFlags::NEXT } else { DescFlags::empty() };
        tq.write_indirect_desc(
            table_gpa,
            i,
            vublk_core::descriptor::Descriptor {
                addr: buf,
                len: 64,
                flags: flags.bits(),
                next,
            },
        );
    }
    tq.write_desc(0, table_gpa, 4 * 16, DescFlags::INDIRECT, 0);
    tq.publish_avail(&[0]);

    let mut vq = tq.make_virtqueue(tq.inflight());
    let iov = vq.dequeue_one().unwrap().expect("chain available");
    assert_eq!(iov.entries().len(), 4);

    vq.push(iov, 0).unwrap();
    assert_eq!(tq.read_used_idx(), 1);
    assert_eq!(tq.read_used_entry(0).id, 0);
}

#[test]
fn combined_direct_then_indirect_chain() {
    let mut tq = TestQueue::new(1024);
    let direct_buf = tq.alloc_data(32);
    tq.write_desc(0, direct_buf, 32, DescFlags::NEXT, 1);

    let table_gpa = tq.alloc_indirect_table(2);
    for i in 0..2u16 {
        let buf = tq.alloc_data(16);
        let flags = if i == 0 { DescFlags::NEXT } else { DescFlags::empty() };
        tq.write_indirect_desc(
            table_gpa,
            i,
            vublk_core::descriptor::Descriptor {
                addr: buf,
                len: 16,
                flags: flags.bits(),
                next: 1,
            },
        );
    }
    tq.write_desc(1, table_gpa, 2 * 16, DescFlags::INDIRECT, 0);
    tq.publish_avail(&[0]);

    let mut vq = tq.make_virtqueue(tq.inflight());
    let iov = vq.dequeue_one().unwrap().expect("chain available");
    assert_eq!(iov.entries().len(), 3, "one direct buffer plus two from the indirect table");
}

#[test]
fn oob_descriptor_breaks_queue() {
    let mut tq = TestQueue::new(16);
    tq.set_avail_entry(0, 100);
    tq.set_avail_idx(1);

    let mut vq = tq.make_virtqueue(tq.inflight());
    let err = vq.dequeue_one().unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::IndexOutOfRange { .. })
    ));
    assert!(vq.is_broken());
}

#[test]
fn descriptor_loop_is_detected() {
    let mut tq = TestQueue::new(4);
    let buf = tq.alloc_data(16);
    tq.write_desc(0, buf, 16, DescFlags::NEXT, 1);
    tq.write_desc(1, buf, 16, DescFlags::NEXT, 2);
    tq.write_desc(2, buf, 16, DescFlags::NEXT, 1); // loops back into 1
    tq.publish_avail(&[0]);

    let mut vq = tq.make_virtqueue(tq.inflight());
    let err = vq.dequeue_one().unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::Loop { .. })));
    assert!(vq.is_broken());
}

#[test]
fn bad_indirect_table_size_breaks_queue() {
    let mut tq = TestQueue::new(16);
    let table_gpa = tq.alloc_indirect_table(1);
    tq.write_desc(0, table_gpa, 15, DescFlags::INDIRECT, 0);
    tq.publish_avail(&[0]);

    let mut vq = tq.make_virtqueue(tq.inflight());
    let err = vq.dequeue_one().unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::BadIndirectTableSize { .. })
    ));
    assert!(vq.is_broken());
}

#[test]
fn broken_queue_rejects_further_dequeues() {
    let mut tq = TestQueue::new(16);
    tq.set_avail_entry(0, 100);
    tq.set_avail_entry(1, 0);
    tq.set_avail_idx(2);

    let mut vq = tq.make_virtqueue(tq.inflight());
    assert!(vq.dequeue_one().is_err());
    assert!(vq.is_broken());

    let second = vq.dequeue_one();
    assert!(matches!(second, Err(Error::QueueBroken)));
}

#[test]
fn inflight_reconnect_replays_uncommitted_heads_in_submission_order() {
    let mut tq = TestQueue::new(16);
    for head in 0..10u16 {
        let buf = tq.alloc_data(16);
        tq.write_desc(head, buf, 16, DescFlags::empty(), 0);
    }
    let heads: Vec<u16> = (0..10).collect();
    tq.publish_avail(&heads);

    let file = tempfile::tempfile().unwrap();
    let inflight = vublk_core::inflight::InflightRegion::create_on(&file, 16).unwrap();
    let mut vq = tq.make_virtqueue(inflight);

    let mut dequeued = std::collections::HashMap::new();
    for _ in 0..10 {
        let iov = vq.dequeue_one().unwrap().expect("chain available");
        dequeued.insert(iov.head(), iov);
    }

    for head in [9u16, 8, 7, 6, 5] {
        let iov = dequeued.remove(&head).unwrap();
        vq.push(iov, 0).unwrap();
    }
    assert_eq!(tq.read_used_idx(), 5);
    vq.release();

    let file2 = file.try_clone().unwrap();
    let inflight2 = vublk_core::inflight::InflightRegion::attach(&file2).unwrap();
    let vq2 = tq.make_virtqueue(inflight2);

    assert_eq!(vq2.replay_order(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn inflight_repair_undoes_torn_commit_on_attach() {
    let mut tq = TestQueue::new(16);
    for head in 0..6u16 {
        let buf = tq.alloc_data(16);
        tq.write_desc(head, buf, 16, DescFlags::empty(), 0);
    }
    tq.publish_avail(&[0, 1, 2, 3, 4, 5]);

    let file = tempfile::tempfile().unwrap();
    let inflight = vublk_core::inflight::InflightRegion::create_on(&file, 16).unwrap();
    let mut vq = tq.make_virtqueue(inflight);

    let mut dequeued = std::collections::HashMap::new();
    for _ in 0..6 {
        let iov = vq.dequeue_one().unwrap().expect("chain available");
        dequeued.insert(iov.head(), iov);
    }
    for head in 0..5u16 {
        let iov = dequeued.remove(&head).unwrap();
        vq.push(iov, 0).unwrap();
    }
    assert_eq!(tq.read_used_idx(), 5);
    vq.release();

    // Hand-simulate a crash between commit steps 2 and 4 for head 5:
    // the guest-visible used ring already has its slot-5 entry and
    // used.idx bumped to 6 (steps 1-2 ran), but the inflight region's
    // `old_used_idx` is the only region-side field that advanced
    // (step 3); `used_idx` and the inflight bit (steps 4-5) did not.
    tq.write_used_entry(5, vublk_core::descriptor::UsedElem { id: 5, len: 0 });
    tq.set_used_idx(6);

    let old_used_idx_offset = 16u64;
    file.write_at(&6u64.to_ne_bytes(), old_used_idx_offset).unwrap();

    let file2 = file.try_clone().unwrap();
    let inflight2 = vublk_core::inflight::InflightRegion::attach(&file2).unwrap();
    assert!(inflight2.is_inflight(5));

    let vq2 = tq.make_virtqueue(inflight2);
    // `init` ran repair during construction.
    assert!(!vq2.replay_order().contains(&5));
}
