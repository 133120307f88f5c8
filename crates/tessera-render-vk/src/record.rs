// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use ash::vk;

use crate::error::VkResultExt;

/// Everything one draw needs, resolved for a frame slot and swapchain image.
pub struct DrawInputs {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    /// The frame slot's set, not the image's.
    pub descriptor_set: vk::DescriptorSet,
    pub clear_color: [f32; 4],
}

/// Colour first, then depth at the far plane. Matches attachment order.
pub fn clear_values(clear_color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// Overwrites `cmd` with one render pass holding one indexed draw. The
/// caller has already observed the owning slot's fence signaled.
pub unsafe fn record_draw(device: &ash::Device, cmd: vk::CommandBuffer, d: &DrawInputs) -> Result<()> {
    device
        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        .op("reset_command_buffer")?;
    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        ..Default::default()
    };
    device
        .begin_command_buffer(cmd, &begin)
        .op("begin_command_buffer")?;

    let clears = clear_values(d.clear_color);
    let (viewport, scissor) = full_viewport(d.extent);
    let rp_begin = vk::RenderPassBeginInfo {
        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
        render_pass: d.render_pass,
        framebuffer: d.framebuffer,
        render_area: scissor,
        clear_value_count: clears.len() as u32,
        p_clear_values: clears.as_ptr(),
        ..Default::default()
    };
    device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);

    device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
    device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, d.pipeline);
    device.cmd_bind_vertex_buffers(cmd, 0, &[d.vertex_buffer], &[0]);
    device.cmd_bind_index_buffer(cmd, d.index_buffer, 0, vk::IndexType::UINT32);
    device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        d.pipeline_layout,
        0,
        &[d.descriptor_set],
        &[],
    );
    device.cmd_draw_indexed(cmd, d.index_count, 1, 0, 0, 0);

    device.cmd_end_render_pass(cmd);
    device.end_command_buffer(cmd).op("end_command_buffer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_values_are_colour_then_far_depth() {
        let c = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(c[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(c[1].depth_stencil.depth, 1.0);
            assert_eq!(c[1].depth_stencil.stencil, 0);
        }
    }

    #[test]
    fn viewport_covers_extent_with_unit_depth() {
        let (vp, sc) = full_viewport(vk::Extent2D {
            width: 1280,
            height: 720,
        });
        assert_eq!((vp.width, vp.height), (1280.0, 720.0));
        assert_eq!((vp.min_depth, vp.max_depth), (0.0, 1.0));
        assert_eq!((sc.extent.width, sc.extent.height), (1280, 720));
        assert_eq!((sc.offset.x, sc.offset.y), (0, 0));
    }
}
