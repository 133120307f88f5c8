// SPDX-License-Identifier: CEPL-1.0
//! GPU buffers and images paired with their backing memory.
//!
//! Every create call performs a real allocation. The returned value owns the
//! handle and its memory together; `destroy` releases both.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::c_void;
use tracing::debug;

use crate::error::{RenderError, VkResultExt};
use crate::transition::BarrierSink;

/// First memory type allowed by `type_bits` that has every `required` flag.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..props.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RenderError::NoMemoryType {
            type_bits,
            properties: required,
        })
}

/// `floor(log2(max(width, height))) + 1`
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

pub struct GpuBuffer {
    pub(crate) buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    pub unsafe fn new(
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = device.create_buffer(&bci, None).op("create_buffer")?;
        let req = device.get_buffer_memory_requirements(buffer);
        let memory = match allocate(device, memory_props, req, properties) {
            Ok(m) => m,
            Err(e) => {
                device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };
        device
            .bind_buffer_memory(buffer, memory, 0)
            .op("bind_buffer_memory")?;
        debug!("buffer created ({size} bytes, {usage:?})");
        Ok(Self {
            buffer,
            memory,
            size,
            usage,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Copies `bytes` into host-visible memory through a temporary mapping.
    pub unsafe fn write_bytes(&self, device: &ash::Device, bytes: &[u8]) -> Result<()> {
        let ptr = device
            .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
            .op("map_memory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        device.unmap_memory(self.memory);
        Ok(())
    }

    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
    }
}

/// Host-visible, host-coherent uniform buffer mapped for its whole lifetime.
pub struct MappedBuffer {
    buffer: GpuBuffer,
    mapped: *mut c_void,
}

impl MappedBuffer {
    pub unsafe fn new(
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let buffer = GpuBuffer::new(
            device,
            memory_props,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let mapped = device
            .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
            .op("map_memory(uniform)")?;
        Ok(Self { buffer, mapped })
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Caller guarantees the GPU is not reading this buffer (its frame
    /// slot's fence has signaled).
    pub unsafe fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() as vk::DeviceSize <= self.buffer.size);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped as *mut u8, bytes.len());
    }

    pub unsafe fn destroy(self, device: &ash::Device) {
        device.unmap_memory(self.buffer.memory);
        self.buffer.destroy(device);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
}

/// A 2D image, its memory, an optional view, and the layout it was last
/// transitioned to. The driver keeps no layout state, so `layout` is the
/// only record of it.
pub struct GpuImage {
    pub(crate) image: vk::Image,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) view: vk::ImageView,
    pub(crate) format: vk::Format,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) mip_levels: u32,
    pub(crate) samples: vk::SampleCountFlags,
    pub(crate) layout: vk::ImageLayout,
}

impl GpuImage {
    pub unsafe fn new(
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        desc: &ImageDesc,
    ) -> Result<Self> {
        let ici = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
            mip_levels: desc.mip_levels,
            array_layers: 1,
            samples: desc.samples,
            tiling: desc.tiling,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = device.create_image(&ici, None).op("create_image")?;
        let req = device.get_image_memory_requirements(image);
        let memory = match allocate(device, memory_props, req, desc.properties) {
            Ok(m) => m,
            Err(e) => {
                device.destroy_image(image, None);
                return Err(e);
            }
        };
        device
            .bind_image_memory(image, memory, 0)
            .op("bind_image_memory")?;
        debug!(
            "image created ({}x{}, {} mips, {:?}, {:?})",
            desc.width, desc.height, desc.mip_levels, desc.format, desc.samples
        );
        Ok(Self {
            image,
            memory,
            view: vk::ImageView::null(),
            format: desc.format,
            width: desc.width,
            height: desc.height,
            mip_levels: desc.mip_levels,
            samples: desc.samples,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Creates the image's view over every mip level.
    pub unsafe fn create_view(
        &mut self,
        device: &ash::Device,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        self.view = create_image_view(device, self.image, self.format, aspect, self.mip_levels)?;
        Ok(self.view)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub unsafe fn destroy(self, device: &ash::Device) {
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view, None);
        }
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

unsafe fn allocate(
    device: &ash::Device,
    memory_props: &vk::PhysicalDeviceMemoryProperties,
    req: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(memory_props, req.memory_type_bits, properties)?;
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    Ok(device.allocate_memory(&mai, None).op("allocate_memory")?)
}

pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let iv_info = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    Ok(device
        .create_image_view(&iv_info, None)
        .op("create_image_view")?)
}

/// A primary command buffer recorded once, submitted, and waited on with
/// `queue_wait_idle` before returning.
pub struct OneShot<'a> {
    device: &'a ash::Device,
    pub(crate) cmd: vk::CommandBuffer,
}

impl BarrierSink for OneShot<'_> {
    fn image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            );
        }
    }

    fn blit(&mut self, image: vk::Image, region: &vk::ImageBlit) {
        unsafe {
            self.device.cmd_blit_image(
                self.cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(region),
                vk::Filter::LINEAR,
            );
        }
    }
}

impl OneShot<'_> {
    pub unsafe fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        self.device
            .cmd_copy_buffer(self.cmd, src, dst, std::slice::from_ref(&region));
    }

    /// Copies tightly packed pixels into mip level 0 (image in transfer-dst).
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        image: vk::Image,
        width: u32,
        height: u32,
    ) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        self.device.cmd_copy_buffer_to_image(
            self.cmd,
            src,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
    }
}

/// Command pool + queue used for setup-time transfers and transitions.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) device: ash::Device,
    pub(crate) pool: vk::CommandPool,
    pub(crate) queue: vk::Queue,
    pub(crate) memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl Transfer {
    /// Records `body` into a fresh command buffer and submits it. When
    /// `body` fails nothing is submitted.
    pub unsafe fn run<T>(&self, body: impl FnOnce(&mut OneShot<'_>) -> Result<T>) -> Result<T> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = self
            .device
            .allocate_command_buffers(&ai)
            .op("allocate_command_buffers(one-shot)")?[0];
        let result = self.record_and_submit(cmd, body);
        self.device
            .free_command_buffers(self.pool, std::slice::from_ref(&cmd));
        result
    }

    unsafe fn record_and_submit<T>(
        &self,
        cmd: vk::CommandBuffer,
        body: impl FnOnce(&mut OneShot<'_>) -> Result<T>,
    ) -> Result<T> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        self.device
            .begin_command_buffer(cmd, &bi)
            .op("begin_command_buffer(one-shot)")?;
        let mut shot = OneShot {
            device: &self.device,
            cmd,
        };
        let value = body(&mut shot)?;
        self.device
            .end_command_buffer(cmd)
            .op("end_command_buffer(one-shot)")?;

        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        self.device
            .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())
            .op("queue_submit(one-shot)")?;
        self.device
            .queue_wait_idle(self.queue)
            .op("queue_wait_idle(one-shot)")?;
        Ok(value)
    }

    /// Staging upload: host bytes -> transient host-visible buffer ->
    /// `dst` on the GPU. The staging buffer is gone when this returns.
    pub unsafe fn upload_via_staging(&self, dst: &GpuBuffer, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = self.staging_buffer(bytes)?;
        let result = self.run(|shot| {
            shot.copy_buffer(staging.buffer, dst.buffer, size);
            Ok(())
        });
        staging.destroy(&self.device);
        result.context("upload_via_staging")
    }

    pub unsafe fn staging_buffer(&self, bytes: &[u8]) -> Result<GpuBuffer> {
        let staging = GpuBuffer::new(
            &self.device,
            &self.memory_props,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write_bytes(&self.device, bytes)?;
        Ok(staging)
    }

    /// Device-local buffer filled from `bytes`.
    pub unsafe fn device_local_buffer(
        &self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        let buffer = GpuBuffer::new(
            &self.device,
            &self.memory_props,
            bytes.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        if let Err(e) = self.upload_via_staging(&buffer, bytes) {
            buffer.destroy(&self.device);
            return Err(e);
        }
        Ok(buffer)
    }
}
