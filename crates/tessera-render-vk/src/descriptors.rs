// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use ash::vk;

use crate::error::{RenderError, VkResultExt};
use crate::frame::MAX_FRAMES_IN_FLIGHT;
use crate::resources::MappedBuffer;
use crate::texture::Texture;

pub fn pool_sizes(sets: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: sets,
        },
    ]
}

/// One descriptor set per frame slot, each pointing at that slot's uniform
/// buffer and the shared texture.
pub struct FrameDescriptors {
    pool: vk::DescriptorPool,
    pub(crate) sets: Vec<vk::DescriptorSet>,
}

impl FrameDescriptors {
    pub unsafe fn new(
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        uniforms: &[MappedBuffer],
        texture: &Texture,
    ) -> Result<Self> {
        let sizes = pool_sizes(MAX_FRAMES_IN_FLIGHT as u32);
        let pool_info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: MAX_FRAMES_IN_FLIGHT as u32,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let pool = device
            .create_descriptor_pool(&pool_info, None)
            .op("create_descriptor_pool")?;

        let layouts = [layout; MAX_FRAMES_IN_FLIGHT];
        let alloc_info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool,
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = match device.allocate_descriptor_sets(&alloc_info) {
            Ok(s) => s,
            Err(code) => {
                device.destroy_descriptor_pool(pool, None);
                return Err(RenderError::Vulkan {
                    op: "allocate_descriptor_sets",
                    code,
                }
                .into());
            }
        };

        let sampled = texture.image().image();
        let image_info = vk::DescriptorImageInfo {
            sampler: texture.sampler(),
            image_view: sampled.view(),
            image_layout: sampled.layout(),
        };
        for (&set, ubo) in sets.iter().zip(uniforms) {
            let buffer_info = vk::DescriptorBufferInfo {
                buffer: ubo.buffer().handle(),
                offset: 0,
                range: ubo.buffer().size(),
            };
            let writes = [
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: set,
                    dst_binding: 0,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: &buffer_info,
                    ..Default::default()
                },
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: set,
                    dst_binding: 1,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: &image_info,
                    ..Default::default()
                },
            ];
            device.update_descriptor_sets(&writes, &[]);
        }

        Ok(Self { pool, sets })
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        // Sets are freed with the pool.
        self.sets.clear();
        device.destroy_descriptor_pool(self.pool, None);
    }
}
