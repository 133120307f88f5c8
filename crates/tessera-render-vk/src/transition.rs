// SPDX-License-Identifier: CEPL-1.0
//! Image layout transitions and mip chain generation.
//!
//! Only the transitions listed in [`transition_masks`] are legal. Everything
//! else fails before a barrier is recorded.

use ash::vk;

use crate::error::RenderError;
use crate::resources::GpuImage;

/// Destination for barrier and blit commands. Implemented over a real
/// command buffer and by recorders in tests.
pub trait BarrierSink {
    fn image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    );

    /// Blit within one image, from a level in TRANSFER_SRC to a level in
    /// TRANSFER_DST, linear filtering.
    fn blit(&mut self, image: vk::Image, region: &vk::ImageBlit);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, RenderError> {
    use vk::ImageLayout as L;
    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
        _ => return Err(RenderError::UnsupportedTransition { old, new }),
    };
    Ok(masks)
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Aspect flags derived from the format, with stencil added for combined
/// depth/stencil formats.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        f if has_stencil(f) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn subresource(aspect_mask: vk::ImageAspectFlags, base_mip: u32, levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: base_mip,
        level_count: levels,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Records one barrier covering all mip levels. The table is consulted
/// first, so an illegal pair records nothing.
pub fn record_transition(
    sink: &mut dyn BarrierSink,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    mip_levels: u32,
) -> Result<(), RenderError> {
    let masks = transition_masks(old, new)?;
    let barrier = vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: masks.src_access,
        dst_access_mask: masks.dst_access,
        old_layout: old,
        new_layout: new,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: subresource(aspect_mask(format), 0, mip_levels),
        ..Default::default()
    };
    sink.image_barrier(masks.src_stage, masks.dst_stage, &barrier);
    Ok(())
}

/// Transitions `image` from its tracked layout to `new` and updates the
/// tracked layout.
pub fn transition(
    sink: &mut dyn BarrierSink,
    image: &mut GpuImage,
    new: vk::ImageLayout,
) -> Result<(), RenderError> {
    record_transition(sink, image.image, image.format, image.layout, new, image.mip_levels)?;
    image.layout = new;
    Ok(())
}

/// Extent of every level: level 0 is `(width, height)`, each next level
/// halves both dimensions, never below 1.
pub fn mip_extents(width: u32, height: u32, levels: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::with_capacity(levels as usize);
    let (mut w, mut h) = (width.max(1), height.max(1));
    for _ in 0..levels {
        out.push((w, h));
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    out
}

fn level_barrier<'a>(
    image: vk::Image,
    level: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'a> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout: old,
        new_layout: new,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: subresource(vk::ImageAspectFlags::COLOR, level, 1),
        ..Default::default()
    }
}

fn offsets(w: u32, h: u32) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D { x: 0, y: 0, z: 0 },
        vk::Offset3D {
            x: w as i32,
            y: h as i32,
            z: 1,
        },
    ]
}

/// Fills levels 1..n of `image` by successive linear blits from level 0.
///
/// Expects every level in TRANSFER_DST with level 0 already holding pixels.
/// Leaves every level in SHADER_READ_ONLY.
pub fn generate_mipmaps(
    sink: &mut dyn BarrierSink,
    image: &mut GpuImage,
    format_features: vk::FormatFeatureFlags,
) -> Result<(), RenderError> {
    if !format_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        return Err(RenderError::LinearBlitUnsupported(image.format));
    }
    if image.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
        return Err(RenderError::UnsupportedTransition {
            old: image.layout,
            new: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        });
    }

    let extents = mip_extents(image.width, image.height, image.mip_levels);
    for level in 1..image.mip_levels {
        let src = level - 1;
        sink.image_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            &level_barrier(
                image.image,
                src,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
        );

        let (sw, sh) = extents[src as usize];
        let (dw, dh) = extents[level as usize];
        let region = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: src,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: offsets(sw, sh),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: offsets(dw, dh),
        };
        sink.blit(image.image, &region);

        sink.image_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &level_barrier(
                image.image,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            ),
        );
    }

    // Last level was only ever written.
    sink.image_barrier(
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        &level_barrier(
            image.image,
            image.mip_levels - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        ),
    );
    image.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    Ok(())
}

/// An image proven to be in SHADER_READ_ONLY layout. Descriptor writes only
/// accept this type.
pub struct SampledImage(GpuImage);

impl SampledImage {
    /// Hands the image back if it is in any other layout.
    pub fn new(image: GpuImage) -> Result<Self, GpuImage> {
        if image.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
            Ok(Self(image))
        } else {
            Err(image)
        }
    }

    pub fn image(&self) -> &GpuImage {
        &self.0
    }

    pub fn into_inner(self) -> GpuImage {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Debug, PartialEq)]
    enum Cmd {
        Barrier {
            src_stage: vk::PipelineStageFlags,
            dst_stage: vk::PipelineStageFlags,
            old: vk::ImageLayout,
            new: vk::ImageLayout,
            base_mip: u32,
            levels: u32,
            aspect: vk::ImageAspectFlags,
        },
        Blit {
            src_mip: u32,
            dst_mip: u32,
            src_end: (i32, i32),
            dst_end: (i32, i32),
        },
    }

    #[derive(Default)]
    struct Recorder(Vec<Cmd>);

    impl BarrierSink for Recorder {
        fn image_barrier(
            &mut self,
            src_stage: vk::PipelineStageFlags,
            dst_stage: vk::PipelineStageFlags,
            b: &vk::ImageMemoryBarrier<'_>,
        ) {
            self.0.push(Cmd::Barrier {
                src_stage,
                dst_stage,
                old: b.old_layout,
                new: b.new_layout,
                base_mip: b.subresource_range.base_mip_level,
                levels: b.subresource_range.level_count,
                aspect: b.subresource_range.aspect_mask,
            });
        }

        fn blit(&mut self, _image: vk::Image, r: &vk::ImageBlit) {
            self.0.push(Cmd::Blit {
                src_mip: r.src_subresource.mip_level,
                dst_mip: r.dst_subresource.mip_level,
                src_end: (r.src_offsets[1].x, r.src_offsets[1].y),
                dst_end: (r.dst_offsets[1].x, r.dst_offsets[1].y),
            });
        }
    }

    fn fake_image(width: u32, height: u32, mip_levels: u32, layout: vk::ImageLayout) -> GpuImage {
        GpuImage {
            image: vk::Image::from_raw(0x1000),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            format: vk::Format::R8G8B8A8_SRGB,
            width,
            height,
            mip_levels,
            samples: vk::SampleCountFlags::TYPE_1,
            layout,
        }
    }

    #[test]
    fn table_covers_exactly_three_pairs() {
        use vk::ImageLayout as L;
        let m = transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::empty());
        assert_eq!(m.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let m = transition_masks(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(m.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(m.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let m = transition_masks(L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).unwrap();
        assert!(m
            .dst_access
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(m.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn every_other_layout_pair_is_rejected() {
        use vk::ImageLayout as L;
        let layouts = [
            L::UNDEFINED,
            L::TRANSFER_DST_OPTIMAL,
            L::TRANSFER_SRC_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            L::COLOR_ATTACHMENT_OPTIMAL,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            L::PRESENT_SRC_KHR,
        ];
        let supported = [
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];

        let mut accepted = 0;
        for old in layouts {
            for new in layouts {
                match transition_masks(old, new) {
                    Ok(_) => {
                        assert!(supported.contains(&(old, new)), "{old:?} -> {new:?}");
                        accepted += 1;
                    }
                    Err(e) => {
                        assert!(!supported.contains(&(old, new)), "{old:?} -> {new:?}");
                        assert!(matches!(e, RenderError::UnsupportedTransition { .. }));
                    }
                }
            }
        }
        assert_eq!(accepted, supported.len());
    }

    #[test]
    fn aspect_follows_format() {
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn illegal_transition_records_nothing_and_keeps_layout() {
        let mut sink = Recorder::default();
        let mut img = fake_image(4, 4, 1, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let err = transition(&mut sink, &mut img, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(err.is_err());
        assert!(sink.0.is_empty());
        assert_eq!(img.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn transition_covers_all_mips_and_tracks_layout() {
        let mut sink = Recorder::default();
        let mut img = fake_image(8, 8, 4, vk::ImageLayout::UNDEFINED);
        transition(&mut sink, &mut img, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(img.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(
            sink.0,
            vec![Cmd::Barrier {
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
                old: vk::ImageLayout::UNDEFINED,
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                base_mip: 0,
                levels: 4,
                aspect: vk::ImageAspectFlags::COLOR,
            }]
        );
    }

    #[test]
    fn depth_transition_sets_stencil_aspect_for_combined_formats() {
        let mut sink = Recorder::default();
        record_transition(
            &mut sink,
            vk::Image::from_raw(1),
            vk::Format::D24_UNORM_S8_UINT,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            1,
        )
        .unwrap();
        match &sink.0[0] {
            Cmd::Barrier { aspect, .. } => assert!(aspect.contains(vk::ImageAspectFlags::STENCIL)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mip_extents_halve_and_clamp() {
        assert_eq!(
            mip_extents(8, 2, 4),
            vec![(8, 2), (4, 1), (2, 1), (1, 1)]
        );
        assert_eq!(mip_extents(5, 5, 3), vec![(5, 5), (2, 2), (1, 1)]);
    }

    #[test]
    fn mipmaps_blit_each_level_from_previous() {
        let mut sink = Recorder::default();
        let mut img = fake_image(4, 2, 3, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        generate_mipmaps(
            &mut sink,
            &mut img,
            vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        )
        .unwrap();

        let blits: Vec<_> = sink
            .0
            .iter()
            .filter_map(|c| match c {
                Cmd::Blit {
                    src_mip,
                    dst_mip,
                    src_end,
                    dst_end,
                } => Some((*src_mip, *dst_mip, *src_end, *dst_end)),
                _ => None,
            })
            .collect();
        assert_eq!(
            blits,
            vec![(0, 1, (4, 2), (2, 1)), (1, 2, (2, 1), (1, 1))]
        );

        // Every level ends in shader-read exactly once.
        let mut finished: Vec<u32> = sink
            .0
            .iter()
            .filter_map(|c| match c {
                Cmd::Barrier {
                    new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    base_mip,
                    levels: 1,
                    ..
                } => Some(*base_mip),
                _ => None,
            })
            .collect();
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1, 2]);
        assert_eq!(sink.0.len(), 2 * 3 + 1);
        assert_eq!(img.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn source_level_becomes_transfer_src_before_its_blit() {
        let mut sink = Recorder::default();
        let mut img = fake_image(16, 16, 5, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        generate_mipmaps(
            &mut sink,
            &mut img,
            vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        )
        .unwrap();
        for (i, cmd) in sink.0.iter().enumerate() {
            if let Cmd::Blit { src_mip, .. } = cmd {
                assert!(matches!(
                    sink.0[i - 1],
                    Cmd::Barrier {
                        new: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        base_mip,
                        ..
                    } if base_mip == *src_mip
                ));
            }
        }
    }

    #[test]
    fn single_level_image_only_gets_final_barrier() {
        let mut sink = Recorder::default();
        let mut img = fake_image(1, 1, 1, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        generate_mipmaps(
            &mut sink,
            &mut img,
            vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        )
        .unwrap();
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn mipmaps_require_linear_filter_support() {
        let mut sink = Recorder::default();
        let mut img = fake_image(4, 4, 3, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let err = generate_mipmaps(&mut sink, &mut img, vk::FormatFeatureFlags::SAMPLED_IMAGE)
            .unwrap_err();
        assert!(matches!(err, RenderError::LinearBlitUnsupported(_)));
        assert!(sink.0.is_empty());
    }

    #[test]
    fn sampled_image_requires_shader_read_layout() {
        let img = fake_image(2, 2, 1, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let img = SampledImage::new(img).err().unwrap();
        let mut img = img;
        img.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        assert!(SampledImage::new(img).is_ok());
    }
}
