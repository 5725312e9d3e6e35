//! The fill, hand-off and readback flow shared by both backends.

use anyhow::{bail, Context};
use ash::vk;
use tessera_gpu::backend::soft::SoftBinding;
use tessera_gpu::{
    Buffer, BufferDesc, BufferTextureCopy, CommandPool, CommandRecorder, Device, DeviceConfig,
    Fence, FenceWait, Queue, QueueFamily, QueueSubmission, Semaphore, SoftDriver, Texture,
    TextureDesc, VulkanContextBuilder,
};
use tracing::{debug, info};

use crate::kernel::{self, PushConstants, GROUP_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub width: u32,
    pub height: u32,
    pub max_iterations: u32,
}

/// Render on the software device with the Mandelbrot kernel.
pub fn soft(params: &Params) -> anyhow::Result<Vec<u8>> {
    let driver = SoftDriver::shared();
    let device = Device::new(driver.clone(), DeviceConfig::default());
    info!("Selected GPU: {}", device.physical().summary());

    let pipeline = driver.create_kernel(kernel::mandelbrot);
    let push = PushConstants {
        width: params.width,
        height: params.height,
        max_iterations: params.max_iterations,
        _pad: 0,
    };
    let pixels = run(&device, params, |recorder, texture| {
        let set = driver.create_descriptor_set(&[SoftBinding::StorageImage(texture.handle())]);
        recorder.cmd_bind_compute_pipeline(pipeline)?;
        recorder.cmd_bind_compute_descriptor_sets(vk::PipelineLayout::null(), 0, &[set])?;
        recorder.cmd_push_constants(
            vk::PipelineLayout::null(),
            vk::ShaderStageFlags::COMPUTE,
            0,
            &push,
        )?;
        recorder.cmd_dispatch(
            params.width.div_ceil(GROUP_SIZE),
            params.height.div_ceil(GROUP_SIZE),
            1,
        )
    });
    driver.destroy_kernel(pipeline);

    let diagnostics = driver.diagnostics();
    if !diagnostics.is_empty() {
        bail!("software device reported hazards: {diagnostics:?}");
    }
    pixels
}

/// Render on a Vulkan device, clearing the image instead of running a
/// shader.
pub fn vulkan(params: &Params, validation: bool) -> anyhow::Result<Vec<u8>> {
    let context = VulkanContextBuilder::new()
        .app_name("tessera-mandelbrot")
        .validation(validation)
        .build()
        .context("creating Vulkan device")?;
    run(context.device(), params, |recorder, texture| {
        texture.cmd_clear_color(
            recorder,
            vk::ClearColorValue {
                float32: [0.05, 0.1, 0.3, 1.0],
            },
        )
    })
}

struct FamilyQueue {
    family: QueueFamily,
    pool: CommandPool,
    queue: Queue,
}

impl FamilyQueue {
    fn new(device: &Device, family: QueueFamily) -> anyhow::Result<Self> {
        let pool = CommandPool::create(device, &family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let queue = Queue::new(device, &family, 0)?;
        Ok(Self {
            family,
            pool,
            queue,
        })
    }

    fn recording(&self) -> anyhow::Result<CommandRecorder> {
        let mut recorder = self.pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(recorder)
    }
}

/// Fill a storage image on the compute family, move it to the transfer
/// family and read it back.
fn run(
    device: &Device,
    params: &Params,
    fill: impl FnOnce(&mut CommandRecorder, &Texture) -> tessera_gpu::Result<()>,
) -> anyhow::Result<Vec<u8>> {
    let physical = device.physical();
    let compute_family = *physical
        .find_dedicated_queue_family(vk::QueueFlags::COMPUTE)
        .context("no compute queue family")?;
    let transfer_family = *physical
        .find_dedicated_queue_family(vk::QueueFlags::TRANSFER)
        .unwrap_or(&compute_family);
    debug!(
        compute = compute_family.index,
        transfer = transfer_family.index,
        "queue families"
    );
    let compute = FamilyQueue::new(device, compute_family)?;
    let transfer = FamilyQueue::new(device, transfer_family)?;
    let hand_off = compute.family.index != transfer.family.index;

    let mut texture = Texture::create(
        device,
        &TextureDesc::new_2d(params.width, params.height, vk::Format::R8G8B8A8_UNORM)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .shared_with(compute.family.index),
    )?;
    let bytes = u64::from(params.width) * u64::from(params.height) * 4;
    let mut readback = Buffer::create(device, &BufferDesc::readback(bytes))?;

    let mut fill_commands = compute.recording()?;
    texture.cmd_transition_layout(
        &mut fill_commands,
        vk::ImageLayout::GENERAL,
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::COMPUTE_SHADER,
    )?;
    fill(&mut fill_commands, &texture)?;
    if hand_off {
        texture.cmd_release_ownership(
            &mut fill_commands,
            transfer.family.index,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        )?;
    }
    fill_commands.end()?;

    let mut copy_commands = transfer.recording()?;
    if hand_off {
        texture.cmd_acquire_ownership(&mut copy_commands, vk::PipelineStageFlags::TRANSFER)?;
    }
    texture.cmd_transition_layout(
        &mut copy_commands,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
    )?;
    texture.cmd_copy_to_buffer(&mut copy_commands, &readback, &BufferTextureCopy::level(0))?;
    copy_commands.end()?;

    let filled = Semaphore::create(device)?;
    let done = Fence::create(device, false)?;
    compute.queue.submit_one(
        QueueSubmission::new()
            .commands(&fill_commands)
            .signal(&filled),
        None,
    )?;
    transfer.queue.submit_one(
        QueueSubmission::new()
            .wait(&filled, vk::PipelineStageFlags::TRANSFER)
            .commands(&copy_commands),
        Some(&done),
    )?;

    if done.wait(10_000_000_000)? == FenceWait::TimedOut {
        bail!("readback did not finish within 10 s");
    }
    let pixels = readback.read(0, bytes as usize)?;
    device.wait_idle()?;

    readback.destroy()?;
    texture.destroy()?;
    Ok(pixels)
}
