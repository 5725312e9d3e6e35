//! A compute kernel fills a storage image, the image moves to the transfer
//! family and is read back through a host-visible buffer.

mod common;

use ash::vk;
use common::FamilyQueue;
use tessera_gpu::backend::soft::{KernelContext, SoftBinding};
use tessera_gpu::{
    Buffer, BufferDesc, BufferTextureCopy, Fence, FenceWait, Ownership, QueueSubmission, Semaphore,
    Texture, TextureDesc,
};

const SIZE: u32 = 64;
const GROUP: u32 = 8;

fn expected_texel(x: u32, y: u32, seed: u32) -> [u8; 4] {
    [(x * 4) as u8, (y * 4) as u8, (seed ^ (x + y)) as u8, 255]
}

fn gradient(ctx: &mut KernelContext<'_>) {
    let seed: u32 = ctx.push_constant(0).unwrap_or_default();
    let [gx, gy, _] = ctx.workgroups;
    let image = &mut ctx.images[0];
    for y in 0..gy * GROUP {
        for x in 0..gx * GROUP {
            image.write_texel(x, y, &expected_texel(x, y, seed));
        }
    }
}

#[test]
fn compute_then_transfer_across_families() {
    let (driver, device) = common::soft_device();
    let compute = FamilyQueue::new(&device, 1);
    let transfer = FamilyQueue::new(&device, 2);

    let mut texture = Texture::create(
        &device,
        &TextureDesc::new_2d(SIZE, SIZE, vk::Format::R8G8B8A8_UNORM)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
            .shared_with(1),
    )
    .unwrap();
    assert_eq!(texture.ownership(), Ownership::Owned(1));
    let bytes = u64::from(SIZE * SIZE * 4);
    let mut readback = Buffer::create(&device, &BufferDesc::readback(bytes)).unwrap();

    let pipeline = driver.create_kernel(gradient);
    let set = driver.create_descriptor_set(&[SoftBinding::StorageImage(texture.handle())]);
    let seed = 0x5au32;

    let mut fill = compute.recording();
    texture
        .cmd_transition_layout(
            &mut fill,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        )
        .unwrap();
    fill.cmd_bind_compute_pipeline(pipeline).unwrap();
    fill.cmd_bind_compute_descriptor_sets(vk::PipelineLayout::null(), 0, &[set])
        .unwrap();
    fill.cmd_push_constants(
        vk::PipelineLayout::null(),
        vk::ShaderStageFlags::COMPUTE,
        0,
        &seed,
    )
    .unwrap();
    fill.cmd_dispatch(SIZE / GROUP, SIZE / GROUP, 1).unwrap();
    texture
        .cmd_release_ownership(&mut fill, 2, vk::PipelineStageFlags::COMPUTE_SHADER)
        .unwrap();
    fill.end().unwrap();
    assert_eq!(texture.ownership(), Ownership::Transferring { from: 1, to: 2 });

    let mut copy = transfer.recording();
    texture
        .cmd_acquire_ownership(&mut copy, vk::PipelineStageFlags::TRANSFER)
        .unwrap();
    texture
        .cmd_transition_layout(
            &mut copy,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        )
        .unwrap();
    texture
        .cmd_copy_to_buffer(&mut copy, &readback, &BufferTextureCopy::level(0))
        .unwrap();
    copy.end().unwrap();
    assert_eq!(texture.ownership(), Ownership::Owned(2));

    let filled = Semaphore::create(&device).unwrap();
    let done = Fence::create(&device, false).unwrap();
    compute
        .queue
        .submit_one(QueueSubmission::new().commands(&fill).signal(&filled), None)
        .unwrap();
    transfer
        .queue
        .submit_one(
            QueueSubmission::new()
                .wait(&filled, vk::PipelineStageFlags::TRANSFER)
                .commands(&copy),
            Some(&done),
        )
        .unwrap();
    assert!(!filled.has_pending_signal());

    assert_eq!(done.wait(u64::MAX).unwrap(), FenceWait::Signalled);
    let pixels = readback.read(0, bytes as usize).unwrap();
    for y in 0..SIZE {
        for x in 0..SIZE {
            let start = ((y * SIZE + x) * 4) as usize;
            assert_eq!(
                pixels[start..start + 4],
                expected_texel(x, y, seed),
                "texel ({x}, {y})"
            );
        }
    }
    assert!(driver.diagnostics().is_empty(), "{:?}", driver.diagnostics());

    compute.queue.wait_idle().unwrap();
    driver.destroy_kernel(pipeline);
    texture.destroy().unwrap();
    readback.destroy().unwrap();
    assert_eq!(driver.live_resources(), 0);
    assert_eq!(driver.live_allocations(), 0);
}

#[test]
fn acquire_needs_a_matching_release() {
    let (_driver, device) = common::soft_device();
    let compute = FamilyQueue::new(&device, 1);
    let transfer = FamilyQueue::new(&device, 2);
    let texture = Texture::create(
        &device,
        &TextureDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
            .shared_with(1),
    )
    .unwrap();

    let mut copy = transfer.recording();
    let err = texture
        .cmd_acquire_ownership(&mut copy, vk::PipelineStageFlags::TRANSFER)
        .unwrap_err();
    assert!(err.as_violation().is_some());
    assert_eq!(texture.ownership(), Ownership::Owned(1));

    let mut fill = compute.recording();
    texture
        .cmd_release_ownership(&mut fill, 2, vk::PipelineStageFlags::COMPUTE_SHADER)
        .unwrap();
    let mut other = compute.recording();
    assert!(texture
        .cmd_release_ownership(&mut other, 2, vk::PipelineStageFlags::COMPUTE_SHADER)
        .is_err());
}
