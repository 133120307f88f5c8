// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, ensure, Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tessera_render::{
    DrawableSurface, FrameStatus, MeshData, RenderSettings, RenderSize, Renderer, TextureData,
};
use tracing::{debug, info};

pub mod descriptors;
pub mod device;
mod error;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod record;
pub mod resources;
pub mod swapchain;
pub mod texture;
pub mod transition;

pub use error::RenderError;
pub use frame::{
    AcquireOutcome, FrameBackend, FrameScheduler, PresentOutcome, RebuildReason,
    MAX_FRAMES_IN_FLIGHT,
};
pub use swapchain::{SwapchainFactory, SwapchainManager};
pub use tessera_math::FrameUniforms;
pub use transition::{BarrierSink, SampledImage, TransitionMasks};

use descriptors::FrameDescriptors;
use device::{DeviceContext, SwapchainSupport};
use error::VkResultExt;
use frame::FrameSlot;
use instance::InstanceContext;
use record::DrawInputs;
use resources::{GpuBuffer, MappedBuffer, Transfer};
use swapchain::VkSwapchainFactory;
use texture::Texture;

pub struct VkRenderer {
    instance: InstanceContext,
    ctx: DeviceContext,
    command_pool: vk::CommandPool,
    frames: Vec<FrameSlot>,
    uniforms: Vec<MappedBuffer>,
    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    index_count: u32,
    texture: Option<Texture>,
    set_layout: vk::DescriptorSetLayout,
    descriptors: FrameDescriptors,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    swapchain: SwapchainManager<VkSwapchainFactory>,
    scheduler: FrameScheduler,
    clear_color: [f32; 4],
}

/// One frame's view of the renderer, borrowed for a single `draw_frame`.
struct VkFrameBackend<'a, S: DrawableSurface + ?Sized> {
    ctx: &'a DeviceContext,
    frames: &'a [FrameSlot],
    uniforms: &'a mut [MappedBuffer],
    swapchain: &'a mut SwapchainManager<VkSwapchainFactory>,
    surface: &'a mut S,
    sets: &'a [vk::DescriptorSet],
    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,
    clear_color: [f32; 4],
}

impl<S: DrawableSurface + ?Sized> VkFrameBackend<'_, S> {
    fn chain(&self) -> Result<&swapchain::Swapchain> {
        self.swapchain
            .chain()
            .ok_or_else(|| anyhow!("no live swapchain"))
    }
}

impl<S: DrawableSurface + ?Sized> FrameBackend for VkFrameBackend<'_, S> {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].in_flight;
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .op("wait_for_fences")?;
        }
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let handle = self.chain()?.handle;
        let acquired = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                handle,
                u64::MAX,
                self.frames[slot].image_available,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("acquired image {index} from a suboptimal swapchain");
                }
                Ok(AcquireOutcome::Image(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(code) => Err(RenderError::Vulkan {
                op: "acquire_next_image",
                code,
            }
            .into()),
        }
    }

    fn write_uniforms(&mut self, slot: usize, uniforms: &FrameUniforms) {
        unsafe { self.uniforms[slot].write(bytemuck::bytes_of(uniforms)) };
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].in_flight;
        unsafe { self.ctx.device.reset_fences(&[fence]) }.op("reset_fences")?;
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let chain = self.chain()?;
        let framebuffer = *chain
            .framebuffers
            .get(image_index as usize)
            .ok_or_else(|| anyhow!("image index {image_index} out of range"))?;
        let inputs = DrawInputs {
            render_pass: self.render_pass,
            framebuffer,
            extent: chain.extent,
            pipeline: self.pipeline,
            pipeline_layout: self.pipeline_layout,
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            index_count: self.index_count,
            descriptor_set: self.sets[slot],
            clear_color: self.clear_color,
        };
        unsafe { record::record_draw(&self.ctx.device, self.frames[slot].command_buffer, &inputs) }
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let f = &self.frames[slot];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &f.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &f.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &f.render_finished,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, std::slice::from_ref(&si), f.in_flight)
                .op("queue_submit")?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let handle = self.chain()?.handle;
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.frames[slot].render_finished,
            swapchain_count: 1,
            p_swapchains: &handle,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let presented = unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &present)
        };
        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(code) => Err(RenderError::Vulkan {
                op: "queue_present",
                code,
            }
            .into()),
        }
    }

    fn rebuild_swapchain(&mut self, reason: RebuildReason) -> Result<()> {
        debug!("swapchain rebuild requested: {reason:?}");
        self.swapchain.recreate(&mut *self.surface)
    }
}

unsafe fn create_command_pool(ctx: &DeviceContext) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: ctx.queue_families.graphics,
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        ..Default::default()
    };
    Ok(ctx
        .device
        .create_command_pool(&pool_info, None)
        .op("create_command_pool")?)
}

/// Rejects mesh and texture data the GPU upload would read out of bounds.
pub fn validate_inputs(mesh: &MeshData, texture: &TextureData) -> Result<()> {
    ensure!(!mesh.vertices.is_empty(), "mesh has no vertices");
    ensure!(!mesh.indices.is_empty(), "mesh has no triangles");
    let count = mesh.vertices.len();
    if let Some(bad) = mesh.indices.iter().find(|&&i| i as usize >= count) {
        return Err(anyhow!("mesh index {bad} out of range for {count} vertices"));
    }

    ensure!(
        texture.width > 0 && texture.height > 0,
        "texture has zero extent {}x{}",
        texture.width,
        texture.height
    );
    let expected = texture.width as usize * texture.height as usize * 4;
    ensure!(
        texture.pixels.len() == expected,
        "texture {}x{} needs {expected} RGBA8 bytes, got {}",
        texture.width,
        texture.height,
        texture.pixels.len()
    );
    Ok(())
}

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    mesh: &MeshData,
    texture_data: &TextureData,
    settings: &RenderSettings,
) -> Result<VkRenderer> {
    validate_inputs(mesh, texture_data)?;

    // STRICT ORDER: instance + surface, then a device that can present to it.
    let instance =
        InstanceContext::new(window, display, settings.validation).context("instance")?;
    let ctx = DeviceContext::new(&instance, settings.max_msaa_samples).context("device")?;
    let device = &ctx.device;

    let command_pool = create_command_pool(&ctx)?;
    let transfer = Transfer {
        device: device.clone(),
        pool: command_pool,
        queue: ctx.graphics_queue,
        memory_props: ctx.memory_properties,
    };

    let support = SwapchainSupport::query(&instance.surface_loader, ctx.phys, instance.surface)?;
    let surface_format = swapchain::choose_surface_format(&support.formats)
        .ok_or(RenderError::NoSuitableDevice)
        .context("surface reports no formats")?;

    let render_pass = pipeline::create_render_pass(
        device,
        surface_format.format,
        ctx.depth_format,
        ctx.msaa_samples,
    )?;
    let set_layout = pipeline::create_descriptor_set_layout(device)?;
    let (pipeline_layout, pipeline) =
        pipeline::create_pipeline(device, render_pass, set_layout, ctx.msaa_samples)
            .context("graphics pipeline")?;

    let factory = VkSwapchainFactory {
        transfer: transfer.clone(),
        swapchain_loader: ctx.swapchain_loader.clone(),
        surface_loader: instance.surface_loader.clone(),
        phys: ctx.phys,
        surface: instance.surface,
        queue_families: ctx.queue_families,
        surface_format,
        depth_format: ctx.depth_format,
        msaa_samples: ctx.msaa_samples,
        vsync: settings.vsync_mode,
        render_pass,
    };
    let swapchain = SwapchainManager::new(factory, size)?;

    let vertex_buffer = transfer
        .device_local_buffer(
            bytemuck::cast_slice(&mesh.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .context("vertex buffer")?;
    let index_buffer = transfer
        .device_local_buffer(
            bytemuck::cast_slice(&mesh.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )
        .context("index buffer")?;

    let format_features = instance
        .instance
        .get_physical_device_format_properties(ctx.phys, texture::TEXTURE_FORMAT)
        .optimal_tiling_features;
    let texture = Texture::upload(&transfer, format_features, ctx.max_anisotropy, texture_data)?;

    let mut uniforms = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        uniforms.push(MappedBuffer::new(
            device,
            &ctx.memory_properties,
            std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
        )?);
    }
    let descriptors = FrameDescriptors::new(device, set_layout, &uniforms, &texture)?;
    let frames = frame::create_frame_slots(device, command_pool)?;

    info!(
        "renderer ready: {} vertices, {} indices",
        mesh.vertices.len(),
        mesh.indices.len()
    );

    Ok(VkRenderer {
        index_count: mesh.indices.len() as u32,
        instance,
        ctx,
        command_pool,
        frames,
        uniforms,
        vertex_buffer: Some(vertex_buffer),
        index_buffer: Some(index_buffer),
        texture: Some(texture),
        set_layout,
        descriptors,
        render_pass,
        pipeline_layout,
        pipeline,
        swapchain,
        scheduler: FrameScheduler::new(),
        clear_color: settings.clear_color,
    })
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        mesh: &MeshData,
        texture: &TextureData,
        settings: &RenderSettings,
    ) -> Result<Self> {
        unsafe { build_renderer(window, display, size, mesh, texture, settings) }
    }

    fn render(
        &mut self,
        surface: &mut dyn DrawableSurface,
        resized: bool,
        uniforms: &FrameUniforms,
    ) -> Result<FrameStatus> {
        if resized {
            self.scheduler.notify_resized();
        }
        // Started minimised: build the first chain now and draw next frame,
        // once the uniforms are computed for the real extent.
        if !self.swapchain.ensure_chain(&mut *surface)? {
            return Ok(FrameStatus::Skipped);
        }
        let (vertex_buffer, index_buffer) = match (&self.vertex_buffer, &self.index_buffer) {
            (Some(v), Some(i)) => (v.handle(), i.handle()),
            _ => return Err(anyhow!("renderer already torn down")),
        };
        let mut backend = VkFrameBackend {
            ctx: &self.ctx,
            frames: &self.frames,
            uniforms: &mut self.uniforms,
            swapchain: &mut self.swapchain,
            surface,
            sets: &self.descriptors.sets,
            render_pass: self.render_pass,
            pipeline: self.pipeline,
            pipeline_layout: self.pipeline_layout,
            vertex_buffer,
            index_buffer,
            index_count: self.index_count,
            clear_color: self.clear_color,
        };
        self.scheduler.draw_frame(&mut backend, uniforms)
    }

    fn extent(&self) -> RenderSize {
        self.swapchain
            .chain()
            .map(|c| RenderSize {
                width: c.extent.width,
                height: c.extent.height,
            })
            .unwrap_or(RenderSize {
                width: 0,
                height: 0,
            })
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle() }.op("device_wait_idle")?;
        Ok(())
    }
}

// STRICT TEARDOWN ORDER (reverse dependency):
// - device_wait_idle()
// - swapchain-sized resources, then the swapchain
// - pipeline, layout, render pass
// - texture, descriptor pool, set layout
// - uniform, index, vertex buffers
// - frame semaphores/fences, command pool
// - device, then messenger, surface, instance
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;
            d.device_wait_idle().ok();

            self.swapchain.destroy();

            d.destroy_pipeline(self.pipeline, None);
            d.destroy_pipeline_layout(self.pipeline_layout, None);
            d.destroy_render_pass(self.render_pass, None);

            if let Some(texture) = self.texture.take() {
                texture.destroy(d);
            }
            self.descriptors.destroy(d);
            d.destroy_descriptor_set_layout(self.set_layout, None);

            for ubo in self.uniforms.drain(..) {
                ubo.destroy(d);
            }
            if let Some(b) = self.index_buffer.take() {
                b.destroy(d);
            }
            if let Some(b) = self.vertex_buffer.take() {
                b.destroy(d);
            }

            frame::destroy_frame_slots(d, &mut self.frames);
            d.destroy_command_pool(self.command_pool, None);

            self.ctx.destroy();
            self.instance.destroy();
        }
    }
}
