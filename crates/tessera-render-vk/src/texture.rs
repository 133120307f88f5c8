// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::vk;
use tessera_render::TextureData;
use tracing::info;

use crate::error::VkResultExt;
use crate::resources::{mip_level_count, GpuImage, ImageDesc, Transfer};
use crate::transition::{generate_mipmaps, transition, SampledImage};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// A fully mipmapped texture and the sampler that reads it.
pub struct Texture {
    image: SampledImage,
    sampler: vk::Sampler,
}

pub fn sampler_info<'a>(max_anisotropy: f32, mip_levels: u32) -> vk::SamplerCreateInfo<'a> {
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        anisotropy_enable: vk::TRUE,
        max_anisotropy,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: mip_levels as f32,
        mip_lod_bias: 0.0,
        ..Default::default()
    }
}

impl Texture {
    /// Staging upload, level 0 copy and mip chain in one submission.
    pub unsafe fn upload(
        transfer: &Transfer,
        format_features: vk::FormatFeatureFlags,
        max_anisotropy: f32,
        data: &TextureData,
    ) -> Result<Self> {
        let device = &transfer.device;
        let mip_levels = mip_level_count(data.width, data.height);
        let staging = transfer.staging_buffer(&data.pixels)?;

        let mut image = match GpuImage::new(
            device,
            &transfer.memory_props,
            &ImageDesc {
                width: data.width,
                height: data.height,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                format: TEXTURE_FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        ) {
            Ok(img) => img,
            Err(e) => {
                staging.destroy(device);
                return Err(e);
            }
        };

        let uploaded = transfer.run(|shot| {
            transition(shot, &mut image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
            shot.copy_buffer_to_image(staging.handle(), image.handle(), data.width, data.height);
            generate_mipmaps(shot, &mut image, format_features)?;
            Ok(())
        });
        staging.destroy(device);
        if let Err(e) = uploaded {
            image.destroy(device);
            return Err(e.context("texture upload"));
        }

        image.create_view(device, vk::ImageAspectFlags::COLOR)?;
        let image = SampledImage::new(image)
            .map_err(|_| anyhow!("texture left outside SHADER_READ_ONLY_OPTIMAL"))?;

        let sampler = device
            .create_sampler(&sampler_info(max_anisotropy, mip_levels), None)
            .op("create_sampler")
            .context("texture sampler")?;

        info!(
            "texture uploaded: {}x{} with {mip_levels} mip levels",
            data.width, data.height
        );
        Ok(Self { image, sampler })
    }

    pub fn image(&self) -> &SampledImage {
        &self.image
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_sampler(self.sampler, None);
        self.image.into_inner().destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_spans_every_mip_with_device_anisotropy() {
        let info = sampler_info(16.0, 11);
        assert_eq!(info.max_lod, 11.0);
        assert_eq!(info.min_lod, 0.0);
        assert_eq!(info.max_anisotropy, 16.0);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
    }
}
