//! Frames in flight driving a swapchain through resizes.

mod common;

use ash::vk;
use common::FamilyQueue;
use tessera_gpu::{
    AcquireOutcome, Buffer, BufferDesc, CommandRecorder, DeferredDeletionQueue, Fence, FrameBegin,
    FrameSyncManager, PresentOutcome, QueuePresentation, QueueSubmission, Semaphore, Swapchain,
    SwapchainDesc,
};

#[test]
fn render_loop_survives_resizes() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let surface = driver.create_surface();
    let mut swapchain = Swapchain::create(&device, &SwapchainDesc::new(surface, 64, 64)).unwrap();
    let mut frames = FrameSyncManager::new(&device, 2).unwrap();
    let mut deletion = DeferredDeletionQueue::new(frames.frames_in_flight());

    let mut recorder = graphics.pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
    recorder.end().unwrap();

    let recreate = |swapchain: &mut Swapchain, frames: &mut FrameSyncManager| {
        device.wait_idle().unwrap();
        swapchain.recreate(&SwapchainDesc::new(surface, 96, 48)).unwrap();
        frames.swapchain_recreated();
    };

    let mut presented = 0;
    let mut stale = 0;
    for iteration in 0..8 {
        if iteration == 3 {
            driver.resize_surface(surface, 96, 48);
        }
        let target = match frames.begin_frame(&mut swapchain, u64::MAX).unwrap() {
            FrameBegin::Ready(target) => target,
            FrameBegin::OutOfDate => {
                stale += 1;
                recreate(&mut swapchain, &mut frames);
                continue;
            }
            other => panic!("unexpected {other:?}"),
        };

        deletion.process(target.frame_number).unwrap();
        let scratch = Buffer::create(
            &device,
            &BufferDesc::new(
                64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
        )
        .unwrap();
        deletion.queue(scratch, target.frame_number);

        frames
            .submit_frame(
                &graphics.queue,
                &target,
                &[&recorder],
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )
            .unwrap();
        if iteration == 5 {
            driver.resize_surface(surface, 64, 64);
        }
        match frames
            .present_frame(&graphics.queue, &mut swapchain, &target)
            .unwrap()
        {
            PresentOutcome::Presented => presented += 1,
            outcome if outcome.needs_recreate() => {
                stale += 1;
                recreate(&mut swapchain, &mut frames);
            }
            outcome => panic!("unexpected {outcome:?}"),
        }
        assert!(deletion.pending_count() <= frames.frames_in_flight() + 1);
    }

    assert_eq!(presented, 6);
    assert_eq!(stale, 2);
    assert_eq!(frames.frame_number(), 7);

    frames.wait_all().unwrap();
    deletion.flush().unwrap();
    assert!(driver.diagnostics().is_empty(), "{:?}", driver.diagnostics());
    assert_eq!(driver.live_resources(), swapchain.image_count() as usize);
    drop(swapchain);
    assert_eq!(driver.live_resources(), 0);
}

#[test]
fn reacquired_images_have_finished_their_last_frame() {
    let (driver, device) = common::soft_device();
    let graphics = FamilyQueue::new(&device, 0);
    let surface = driver.create_surface();
    let mut swapchain = Swapchain::create(&device, &SwapchainDesc::new(surface, 64, 64)).unwrap();
    assert_eq!(swapchain.image_count(), 3);

    let mut recorder = graphics.pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    recorder.begin(CommandRecorder::DEFAULT_USAGE).unwrap();
    recorder.end().unwrap();

    let mut image_available = Vec::new();
    let mut render_finished = Vec::new();
    let mut fences = Vec::new();
    let mut last_frame_for_image: Vec<Option<usize>> = vec![None; 3];

    for frame in 0..10 {
        image_available.push(Semaphore::create(&device).unwrap());
        render_finished.push(Semaphore::create(&device).unwrap());
        fences.push(Fence::create(&device, false).unwrap());

        let index = match swapchain
            .acquire_next_image(u64::MAX, Some(&image_available[frame]), None)
            .unwrap()
        {
            AcquireOutcome::Acquired { index, .. } => index,
            other => panic!("unexpected {other:?}"),
        };
        if let Some(previous) = last_frame_for_image[index as usize] {
            assert!(fences[previous].is_signalled().unwrap());
        }
        last_frame_for_image[index as usize] = Some(frame);

        graphics
            .queue
            .submit_one(
                QueueSubmission::new()
                    .wait(
                        &image_available[frame],
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    )
                    .commands(&recorder)
                    .signal(&render_finished[frame]),
                Some(&fences[frame]),
            )
            .unwrap();
        let report = graphics
            .queue
            .present(
                QueuePresentation::new()
                    .wait(&render_finished[frame])
                    .swapchain(&mut swapchain, index),
            )
            .unwrap();
        assert!(report.all_presented());
    }

    device.wait_idle().unwrap();
    assert!(fences.iter().all(|f| f.is_signalled().unwrap()));
    assert!(driver.diagnostics().is_empty(), "{:?}", driver.diagnostics());
}
