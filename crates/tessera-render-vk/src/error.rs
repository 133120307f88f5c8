// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Fatal conditions raised by the Vulkan backend.
///
/// Out-of-date and suboptimal surfaces are not listed here: they are
/// ordinary outcomes of acquire/present and drive a swapchain rebuild.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no physical device satisfies the renderer's requirements")]
    NoSuitableDevice,

    #[error("required instance extensions are missing: {}", .0.join(", "))]
    MissingInstanceExtensions(Vec<String>),

    #[error("validation layer {0} requested but not available")]
    ValidationLayerUnavailable(String),

    #[error("no memory type matches bits {type_bits:#x} with {properties:?}")]
    NoMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("format {0:?} does not support linear blitting")]
    LinearBlitUnsupported(vk::Format),

    #[error("{op} failed (VkResult {code:?} = {})", .code.as_raw())]
    Vulkan {
        op: &'static str,
        code: vk::Result,
    },
}

pub(crate) trait VkResultExt<T> {
    /// Tags a raw `VkResult` with the name of the call that produced it.
    fn op(self, op: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn op(self, op: &'static str) -> Result<T, RenderError> {
        self.map_err(|code| RenderError::Vulkan { op, code })
    }
}
