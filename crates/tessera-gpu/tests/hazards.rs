//! Ordering and lifetime hazards observed through the software device.

mod common;

use ash::vk;
use common::FamilyQueue;
use tessera_gpu::backend::soft::{Diagnostic, SoftDriverConfig, TraceEvent};
use tessera_gpu::{
    Buffer, BufferDesc, Fence, FenceWait, GpuError, QueueSubmission, Texture, TextureDesc,
};

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Barrier {
        base: u32,
        count: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    Upload(u32),
    Blit(u32, u32),
}

fn steps_for(trace: &[TraceEvent], image: vk::Image) -> Vec<Step> {
    trace
        .iter()
        .filter_map(|event| match *event {
            TraceEvent::ImageBarrier {
                image: target,
                base_mip_level,
                level_count,
                old_layout,
                new_layout,
                ..
            } if target == image => Some(Step::Barrier {
                base: base_mip_level,
                count: level_count,
                old: old_layout,
                new: new_layout,
            }),
            TraceEvent::CopyBufferToImage {
                image: target,
                mip_level,
                ..
            } if target == image => Some(Step::Upload(mip_level)),
            TraceEvent::Blit {
                src,
                src_level,
                dst_level,
                ..
            } if src == image => Some(Step::Blit(src_level, dst_level)),
            _ => None,
        })
        .collect()
}

#[test]
fn mip_chain_is_built_level_by_level() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let mut texture = Texture::create(
        &device,
        &TextureDesc::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .full_mip_chain(),
    )
    .unwrap();
    assert_eq!(texture.mip_levels(), 4);
    texture
        .upload(&graphics.pool, &graphics.queue, &[200u8; 8 * 8 * 4])
        .unwrap();

    use vk::ImageLayout as L;
    let mut expected = vec![
        Step::Barrier {
            base: 0,
            count: 4,
            old: L::UNDEFINED,
            new: L::TRANSFER_DST_OPTIMAL,
        },
        Step::Upload(0),
    ];
    for level in 1..4 {
        expected.push(Step::Barrier {
            base: level - 1,
            count: 1,
            old: L::TRANSFER_DST_OPTIMAL,
            new: L::TRANSFER_SRC_OPTIMAL,
        });
        expected.push(Step::Blit(level - 1, level));
        expected.push(Step::Barrier {
            base: level - 1,
            count: 1,
            old: L::TRANSFER_SRC_OPTIMAL,
            new: L::SHADER_READ_ONLY_OPTIMAL,
        });
    }
    expected.push(Step::Barrier {
        base: 3,
        count: 1,
        old: L::TRANSFER_DST_OPTIMAL,
        new: L::SHADER_READ_ONLY_OPTIMAL,
    });

    assert_eq!(steps_for(&driver.trace(), texture.handle()), expected);
    assert_eq!(driver.read_image(texture.handle(), 3, 0).unwrap(), vec![200; 4]);
    assert!(driver.diagnostics().is_empty());
}

#[test]
fn intermediate_mip_levels_end_shader_readable() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let mut texture = Texture::create(
        &device,
        &TextureDesc::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .layout(vk::ImageLayout::GENERAL)
            .full_mip_chain(),
    )
    .unwrap();
    texture
        .upload(&graphics.pool, &graphics.queue, &[64u8; 8 * 8 * 4])
        .unwrap();

    let after_blit: Vec<(u32, vk::ImageLayout)> = steps_for(&driver.trace(), texture.handle())
        .into_iter()
        .filter_map(|step| match step {
            Step::Barrier {
                base,
                old: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                new,
                ..
            } => Some((base, new)),
            _ => None,
        })
        .collect();
    assert_eq!(
        after_blit,
        (0..3)
            .map(|level| (level, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
            .collect::<Vec<_>>()
    );

    use vk::ImageLayout as L;
    let tracked = [
        L::SHADER_READ_ONLY_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL,
        L::GENERAL,
    ];
    assert_eq!(texture.layouts(), tracked);
    assert_eq!(driver.image_layouts(texture.handle()).unwrap(), tracked);
    assert!(driver.diagnostics().is_empty());
}

#[test]
fn mip_generation_covers_every_layer() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let mut texture = Texture::create(
        &device,
        &TextureDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .layers(2)
            .full_mip_chain(),
    )
    .unwrap();
    assert_eq!(texture.mip_levels(), 3);

    let mut texels = vec![30u8; 4 * 4 * 4];
    texels.extend(std::iter::repeat(220u8).take(4 * 4 * 4));
    texture
        .upload(&graphics.pool, &graphics.queue, &texels)
        .unwrap();

    let image = texture.handle();
    let mut blits = 0;
    let mut barriers = 0;
    for event in driver.trace() {
        match event {
            TraceEvent::Blit {
                src, layer_count, ..
            } if src == image => {
                blits += 1;
                assert_eq!(layer_count, 2);
            }
            TraceEvent::ImageBarrier {
                image: target,
                base_array_layer,
                layer_count,
                ..
            } if target == image => {
                barriers += 1;
                assert_eq!((base_array_layer, layer_count), (0, 2));
            }
            _ => {}
        }
    }
    assert_eq!(blits, 2);
    assert_eq!(barriers, 6);

    assert_eq!(driver.read_image(image, 2, 0).unwrap(), vec![30; 4]);
    assert_eq!(driver.read_image(image, 2, 1).unwrap(), vec![220; 4]);
    assert!(driver.diagnostics().is_empty());
}

fn copy_setup(device: &tessera_gpu::Device) -> (Buffer, Buffer) {
    let mut src = Buffer::create(device, &BufferDesc::staging(256)).unwrap();
    src.write(0, &[7u8; 256]).unwrap();
    let dst = Buffer::create(
        device,
        &BufferDesc::new(
            256,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
    )
    .unwrap();
    (src, dst)
}

#[test]
fn destroying_a_buffer_before_its_fence_is_observed() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let (mut src, dst) = copy_setup(&device);

    let mut recorder = graphics.recording();
    src.cmd_copy_to(&mut recorder, &dst, 0, 0, 0).unwrap();
    recorder.end().unwrap();
    let fence = Fence::create(&device, false).unwrap();
    graphics
        .queue
        .submit_one(QueueSubmission::new().commands(&recorder), Some(&fence))
        .unwrap();

    src.destroy().unwrap();
    assert!(driver
        .diagnostics()
        .iter()
        .any(|d| matches!(d, Diagnostic::DestroyedWhileInUse { kind: "buffer", .. })));

    assert_eq!(fence.wait(u64::MAX).unwrap(), FenceWait::Signalled);
    assert!(driver
        .take_diagnostics()
        .iter()
        .any(|d| matches!(d, Diagnostic::UseOfDestroyedObject { kind: "buffer", .. })));
}

#[test]
fn destroying_after_the_fence_is_clean() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let (mut src, mut dst) = copy_setup(&device);

    let mut recorder = graphics.recording();
    src.cmd_copy_to(&mut recorder, &dst, 128, 0, 64).unwrap();
    recorder.end().unwrap();
    let fence = Fence::create(&device, false).unwrap();
    graphics
        .queue
        .submit_one(QueueSubmission::new().commands(&recorder), Some(&fence))
        .unwrap();
    assert!(driver.pending_operations() > 0);

    fence.wait(u64::MAX).unwrap();
    assert_eq!(driver.pending_operations(), 0);
    src.destroy().unwrap();
    dst.destroy().unwrap();
    assert!(driver.diagnostics().is_empty(), "{:?}", driver.diagnostics());
    assert_eq!(driver.live_allocations(), 0);
}

#[test]
fn device_loss_fails_every_later_call() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let (src, dst) = copy_setup(&device);

    let mut recorder = graphics.recording();
    src.cmd_copy_to(&mut recorder, &dst, 0, 0, 0).unwrap();
    recorder.end().unwrap();
    let fence = Fence::create(&device, false).unwrap();
    graphics
        .queue
        .submit_one(QueueSubmission::new().commands(&recorder), Some(&fence))
        .unwrap();

    driver.lose_device();
    let err = fence.wait(u64::MAX).unwrap_err();
    assert!(err.is_device_lost());
    assert!(device.is_lost());

    let err = Buffer::create(&device, &BufferDesc::staging(16)).unwrap_err();
    assert!(matches!(err, GpuError::DeviceLost { .. }));
    assert!(Fence::create(&device, true).unwrap_err().is_device_lost());
}

#[test]
#[should_panic(expected = "protocol violation")]
fn strict_device_panics_on_double_destroy() {
    let (_driver, device) = common::soft_device_with(SoftDriverConfig::default(), true);
    let mut buffer = Buffer::create(&device, &BufferDesc::staging(16)).unwrap();
    buffer.destroy().unwrap();
    let _ = buffer.destroy();
}
