//! Queue family sharing: concurrent resources are usable from every
//! registered family, exclusive ones only from their owner.

mod common;

use common::FamilyQueue;
use tessera_gpu::{
    Buffer, BufferDesc, Fence, Ownership, ProtocolViolation, QueueSubmission, SharingMode,
};

#[test]
fn concurrent_buffers_copy_from_both_families() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let compute = FamilyQueue::new(&device, 1);

    let pattern: Vec<u8> = (0..128u8).collect();
    let mut src = Buffer::create(&device, &BufferDesc::staging(128).shared_with(0).shared_with(1))
        .unwrap();
    src.write(0, &pattern).unwrap();
    let mut dst = Buffer::create(&device, &BufferDesc::readback(128).shared_with(1).shared_with(0))
        .unwrap();
    assert_eq!(src.sharing_mode(), &SharingMode::Concurrent(vec![0, 1]));
    assert_eq!(dst.sharing_mode(), &SharingMode::Concurrent(vec![1, 0]));

    let mut first = graphics.recording();
    src.cmd_copy_to(&mut first, &dst, 64, 0, 0).unwrap();
    first.end().unwrap();
    let mut second = compute.recording();
    src.cmd_copy_to(&mut second, &dst, 64, 64, 64).unwrap();
    second.end().unwrap();

    let fences = [
        Fence::create(&device, false).unwrap(),
        Fence::create(&device, false).unwrap(),
    ];
    graphics
        .queue
        .submit_one(QueueSubmission::new().commands(&first), Some(&fences[0]))
        .unwrap();
    compute
        .queue
        .submit_one(QueueSubmission::new().commands(&second), Some(&fences[1]))
        .unwrap();
    tessera_gpu::wait_for_fences(&device, &[&fences[0], &fences[1]], true, u64::MAX).unwrap();

    assert_eq!(dst.read(0, 128).unwrap(), pattern);
    assert!(driver.diagnostics().is_empty());
}

#[test]
fn exclusive_buffers_stay_with_their_first_family() {
    let (_driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let compute = FamilyQueue::new(&device, 1);

    let src = Buffer::create(&device, &BufferDesc::staging(64)).unwrap();
    let dst = Buffer::create(&device, &BufferDesc::readback(64)).unwrap();
    assert_eq!(src.sharing_mode(), &SharingMode::Exclusive);

    let mut first = graphics.recording();
    src.cmd_copy_to(&mut first, &dst, 0, 0, 0).unwrap();

    let mut second = compute.recording();
    let err = src.cmd_copy_to(&mut second, &dst, 0, 0, 0).unwrap_err();
    assert_eq!(
        err.as_violation(),
        Some(&ProtocolViolation::ExclusiveOwnership {
            owner: 0,
            family: 1
        })
    );
}

#[test]
fn concurrent_buffers_reject_unregistered_families() {
    let (_driver, device) = common::soft_device();
    let transfer = FamilyQueue::new(&device, 2);
    let buffer = Buffer::create(
        &device,
        &BufferDesc::readback(64).shared_with(0).shared_with(1),
    )
    .unwrap();

    let mut recorder = transfer.recording();
    let err = buffer.cmd_fill(&mut recorder, 0, 64, 0).unwrap_err();
    assert!(matches!(
        err.as_violation(),
        Some(ProtocolViolation::ExclusiveOwnership { family: 2, .. })
    ));
}

#[test]
fn rejected_copies_claim_neither_side() {
    let (_driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);

    let src = Buffer::create(&device, &BufferDesc::staging(64)).unwrap();
    let dst = Buffer::create(&device, &BufferDesc::readback(64).shared_with(1)).unwrap();
    assert_eq!(dst.ownership(), Ownership::Owned(1));

    let mut recorder = graphics.recording();
    let err = src.cmd_copy_to(&mut recorder, &dst, 0, 0, 0).unwrap_err();
    assert_eq!(
        err.as_violation(),
        Some(&ProtocolViolation::ExclusiveOwnership {
            owner: 1,
            family: 0
        })
    );
    assert_eq!(src.ownership(), Ownership::Unclaimed);
    assert_eq!(dst.ownership(), Ownership::Owned(1));
}
