//! Drives a small producer tree for a couple of frames without a GPU. The device only logs submissions and the
//! "GPU" finishes each frame one frame later by signaling host fences.

use futures::executor::{ThreadPool, block_on};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tessel::{
    ash::vk::{self, Handle},
    dfe::{DeferredFenceExecution, DfeConfig},
    gpu::{GpuDevice, SemaphoreOp, SharedFence, SubmitBatch},
    sync::HostFence,
};
use tessel_graph::{
    ExportMode, ExportedBuffer, ExportedImage, GpuTaskOrder, GpuTaskProducer, GraphError,
    ImageState, OrderMode, PrepareContext, ProducerTree, ResourceId, SetupContext, SubmitContext,
    Version, Viewport,
};

const FRAMES: u64 = 5;

const GRAPHICS: u64 = 0x100;
const TRANSFER: u64 = 0x200;

const VERTICES: ResourceId = ResourceId::new("demo.vertices");
const COLOR: ResourceId = ResourceId::new("demo.color");

struct HeadlessDevice {
    batches: AtomicUsize,
}

impl GpuDevice for HeadlessDevice {
    fn submit(&self, batches: &[SubmitBatch]) -> Result<(), vk::Result> {
        for batch in batches {
            log::info!(
                "Submit {} command buffers to {:?} (waits: {}, signals: {})",
                batch.command_buffers.len(),
                batch.queue,
                batch.waits.len(),
                batch.signals.len()
            );
        }
        self.batches.fetch_add(batches.len(), Ordering::Relaxed);
        Ok(())
    }

    fn after_submissions(&self, queues: &[vk::Queue], callback: Box<dyn FnOnce() + Send>) {
        //submissions are executed synchronously, so they already happened
        log::trace!("{} queues received their submissions", queues.len());
        callback();
    }
}

fn extent() -> vk::Extent2D {
    vk::Extent2D {
        width: 1280,
        height: 720,
    }
}

///Root of the tree. Sets the viewport everyone renders to.
struct FrameRoot;

impl GpuTaskProducer for FrameRoot {
    type SetupState = ();
    type PrepareState = ();

    fn name(&self) -> &str {
        "frame-root"
    }

    fn prepare(
        &mut self,
        ctx: &mut PrepareContext<'_, '_, Self>,
    ) -> Result<Option<()>, GraphError> {
        ctx.set_viewport(Viewport::from_extent(extent()))?;
        Ok(None)
    }

    fn submit(&self, _ctx: &SubmitContext<'_, Self>, _batches: &mut Vec<SubmitBatch>) {}
}

///Mapped memory that is written by the host and copied on the transfer queue.
struct StagingBuffer {
    frame: u64,
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        log::info!("Freeing staging buffer of frame {}", self.frame);
    }
}

struct Uploader {
    upload_done: vk::Semaphore,
}

impl GpuTaskProducer for Uploader {
    type SetupState = ();
    type PrepareState = StagingBuffer;
    const ORDER: OrderMode = OrderMode::Prologue;

    fn name(&self) -> &str {
        "uploader"
    }

    fn prepare(
        &mut self,
        ctx: &mut PrepareContext<'_, '_, Self>,
    ) -> Result<Option<StagingBuffer>, GraphError> {
        let frame = ctx.frame();
        ctx.export(
            VERTICES,
            ExportedBuffer {
                buffer: vk::Buffer::from_raw(0x1000),
                offset: 0,
                size: 4096,
                access: vk::AccessFlags2::TRANSFER_WRITE,
                stage: vk::PipelineStageFlags2::COPY,
            },
            ExportMode::Constant,
        )?;
        ctx.request_transfer(
            SubmitBatch::new(vk::Queue::from_raw(TRANSFER))
                .with_command_buffer(vk::CommandBuffer::from_raw(0x2000 + frame))
                .with_signal(SemaphoreOp::binary(self.upload_done)),
        );
        Ok(Some(StagingBuffer { frame }))
    }

    fn submit(&self, _ctx: &SubmitContext<'_, Self>, _batches: &mut Vec<SubmitBatch>) {}
}

///Render targets. Recreated whenever setup is invalidated, for instance after a resize.
struct Targets {
    generation: u64,
    images: [vk::Image; 2],
}

impl Drop for Targets {
    fn drop(&mut self) {
        log::info!("Destroying render targets of generation {}", self.generation);
    }
}

struct Renderer {
    upload_done: vk::Semaphore,
    generation: u64,
}

impl GpuTaskProducer for Renderer {
    type SetupState = Targets;
    type PrepareState = ();

    fn name(&self) -> &str {
        "renderer"
    }

    fn setup(&mut self, _ctx: &SetupContext) -> Result<Option<Targets>, GraphError> {
        self.generation += 1;
        let base = 0x3000 + self.generation * 0x10;
        log::info!("Creating render targets of generation {}", self.generation);
        Ok(Some(Targets {
            generation: self.generation,
            images: [vk::Image::from_raw(base), vk::Image::from_raw(base + 1)],
        }))
    }

    fn prepare(
        &mut self,
        ctx: &mut PrepareContext<'_, '_, Self>,
    ) -> Result<Option<()>, GraphError> {
        let vertices = ctx.import_buffer(
            VERTICES,
            Version::Latest,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        )?;
        log::trace!("Renderer reads vertices {:?}", vertices.buffer);

        let size = ctx.viewport().map(|v| v.size).unwrap_or(extent());
        let targets = ctx.setup_state();
        //geometry pass, followed by a post pass into the second target
        for image in targets.images {
            let exported = ExportedImage {
                image,
                view: vk::ImageView::from_raw(image.as_raw()),
                format: vk::Format::R16G16B16A16_SFLOAT,
                extent: vk::Extent3D {
                    width: size.width,
                    height: size.height,
                    depth: 1,
                },
                subresource_range: vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
                state: ImageState::new(
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                ),
            };
            ctx.export(COLOR, exported, ExportMode::Versioned)?;
        }
        Ok(None)
    }

    fn submit(&self, ctx: &SubmitContext<'_, Self>, batches: &mut Vec<SubmitBatch>) {
        batches.push(
            SubmitBatch::new(vk::Queue::from_raw(GRAPHICS))
                .with_command_buffer(vk::CommandBuffer::from_raw(0x4000 + ctx.frame()))
                .with_wait(SemaphoreOp::new(
                    self.upload_done,
                    0,
                    vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                )),
        );
    }
}

struct Composer;

impl GpuTaskProducer for Composer {
    type SetupState = ();
    type PrepareState = ();
    const ORDER: OrderMode = OrderMode::Epilogue;

    fn name(&self) -> &str {
        "composer"
    }

    fn prepare(
        &mut self,
        ctx: &mut PrepareContext<'_, '_, Self>,
    ) -> Result<Option<()>, GraphError> {
        let read = ImageState::new(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        );
        let geometry = ctx.import_image(COLOR, Version::Exact(0), read)?;
        let post = ctx.import_image(COLOR, Version::Latest, read)?;
        let vertices = ctx.import_buffer(
            VERTICES,
            Version::Latest,
            vk::AccessFlags2::NONE,
            vk::PipelineStageFlags2::NONE,
        )?;
        log::info!(
            "Composing {:?} and {:?} (found in {:?}), vertices last used by {:?}",
            geometry.image,
            post.image,
            post.state.layout,
            vertices.access
        );
        Ok(None)
    }

    fn submit(&self, ctx: &SubmitContext<'_, Self>, batches: &mut Vec<SubmitBatch>) {
        batches.push(
            SubmitBatch::new(vk::Queue::from_raw(GRAPHICS))
                .with_command_buffer(vk::CommandBuffer::from_raw(0x5000 + ctx.frame())),
        );
    }
}

fn main() -> Result<(), anyhow::Error> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let pool = ThreadPool::new()?;
    let device = Arc::new(HeadlessDevice {
        batches: AtomicUsize::new(0),
    });
    let dfe = Arc::new(DeferredFenceExecution::new(
        device.clone(),
        DfeConfig::default().with_batch_size(4),
    ));

    let graphics = vk::Queue::from_raw(GRAPHICS);
    let transfer = vk::Queue::from_raw(TRANSFER);
    dfe.queue_index(graphics)?;
    dfe.queue_index(transfer)?;
    let all_queues = dfe.queue_mask(&[graphics, transfer])?;

    let upload_done = vk::Semaphore::from_raw(0x10);
    let mut tree = ProducerTree::new(dfe.clone());
    let root = tree.insert_root(FrameRoot);
    tree.insert_child(root, Composer)?;
    let renderer = tree.insert_child(
        root,
        Renderer {
            upload_done,
            generation: 0,
        },
    )?;
    tree.insert_child(root, Uploader { upload_done })?;

    let mut gpu_frame: Vec<Arc<HostFence>> = Vec::new();
    for frame in 0..FRAMES {
        if frame == 2 {
            log::info!("Simulating resize");
            tree.invalidate_setup(renderer)?;
        }

        let summary = tree.begin_frame()?;
        let mut order = GpuTaskOrder::new();
        tree.submit(&mut order, &pool)?;
        let submitted = block_on(order.prepare_submissions(device.clone(), &pool)?)?;
        log::info!(
            "Frame {}: prepared {} producers, submitted {} batches",
            summary.frame,
            summary.prepared,
            submitted
        );

        //Something the host wants to keep alive until both queues are done with this frame.
        let readback = Arc::new(vec![0u8; 64]);
        dfe.defer(all_queues, {
            let readback = readback.clone();
            move || log::info!("Reading back {} bytes", readback.len())
        });

        let fences = [HostFence::new(), HostFence::new()];
        dfe.set_end_frame_fences(&[
            (graphics, fences[0].clone() as SharedFence),
            (transfer, fences[1].clone() as SharedFence),
        ])?;

        //the "GPU" finishes the previous frame while this one is recorded
        for fence in gpu_frame.drain(..) {
            fence.signal();
        }
        gpu_frame.extend(fences);

        let executed = dfe.poll(&pool);
        log::info!(
            "Scheduled {} deferred calls, {} frames alive",
            executed,
            dfe.alive_frames()
        );
    }

    let executed = dfe.assume_device_idle();
    log::info!(
        "Device idle, executed remaining {} deferred calls. {} batches submitted in total",
        executed,
        device.batches.load(Ordering::Relaxed)
    );

    Ok(())
}
