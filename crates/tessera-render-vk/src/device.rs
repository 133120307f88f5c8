// SPDX-License-Identifier: CEPL-1.0
//! Physical device selection and logical device creation.

use anyhow::{Context, Result};
use ash::khr::{surface, swapchain};
use ash::vk;
use std::ffi::CStr;
use tracing::{debug, info, warn};

use crate::error::{RenderError, VkResultExt};
use crate::instance::InstanceContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Distinct families, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// First graphics-capable family and first family that can present.
/// The two may be the same.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    can_present: impl Fn(u32) -> bool,
) -> (Option<u32>, Option<u32>) {
    let graphics = families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32);
    let present = (0..families.len() as u32).find(|&i| can_present(i));
    (graphics, present)
}

#[derive(Clone, Debug, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn query(
        loader: &surface::Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: loader
                .get_physical_device_surface_capabilities(phys, surface)
                .op("get_physical_device_surface_capabilities")?,
            formats: loader
                .get_physical_device_surface_formats(phys, surface)
                .op("get_physical_device_surface_formats")?,
            present_modes: loader
                .get_physical_device_surface_present_modes(phys, surface)
                .op("get_physical_device_surface_present_modes")?,
        })
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// A surface query that fails disqualifies that one device only.
pub fn support_is_adequate(name: &str, query: Result<SwapchainSupport>) -> bool {
    match query {
        Ok(support) => support.is_adequate(),
        Err(e) => {
            warn!("surface query failed on {name}: {e:#}");
            false
        }
    }
}

/// What selection needs to know about one physical device.
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
    pub has_swapchain_extension: bool,
    pub swapchain_adequate: bool,
    pub sampler_anisotropy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    NotDiscrete,
    NoGraphicsQueue,
    NoPresentQueue,
    MissingSwapchainExtension,
    InadequateSwapchain,
    NoAnisotropy,
}

impl DeviceCandidate {
    pub fn evaluate(&self) -> Result<QueueFamilyIndices, Rejection> {
        if self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return Err(Rejection::NotDiscrete);
        }
        let graphics = self.graphics_family.ok_or(Rejection::NoGraphicsQueue)?;
        let present = self.present_family.ok_or(Rejection::NoPresentQueue)?;
        if !self.has_swapchain_extension {
            return Err(Rejection::MissingSwapchainExtension);
        }
        // Surface support is only meaningful once the extension is known present.
        if !self.swapchain_adequate {
            return Err(Rejection::InadequateSwapchain);
        }
        if !self.sampler_anisotropy {
            return Err(Rejection::NoAnisotropy);
        }
        Ok(QueueFamilyIndices { graphics, present })
    }
}

/// Highest sample count supported by both colour and depth attachments,
/// capped at `cap`.
pub fn max_usable_sample_count(counts: vk::SampleCountFlags, cap: u32) -> vk::SampleCountFlags {
    const ORDER: [(vk::SampleCountFlags, u32); 6] = [
        (vk::SampleCountFlags::TYPE_64, 64),
        (vk::SampleCountFlags::TYPE_32, 32),
        (vk::SampleCountFlags::TYPE_16, 16),
        (vk::SampleCountFlags::TYPE_8, 8),
        (vk::SampleCountFlags::TYPE_4, 4),
        (vk::SampleCountFlags::TYPE_2, 2),
    ];
    ORDER
        .iter()
        .find(|(flag, n)| *n <= cap && counts.contains(*flag))
        .map(|(flag, _)| *flag)
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn choose_depth_format(supports_depth: impl Fn(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_CANDIDATES.into_iter().find(|&f| supports_depth(f))
}

/// Logical device, its queues, and the per-device facts the rest of the
/// renderer reads. Created once; never rebuilt.
pub struct DeviceContext {
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) queue_families: QueueFamilyIndices,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) msaa_samples: vk::SampleCountFlags,
    pub(crate) max_anisotropy: f32,
    pub(crate) depth_format: vk::Format,
    pub(crate) swapchain_loader: swapchain::Device,
}

unsafe fn describe(ctx: &InstanceContext, phys: vk::PhysicalDevice) -> DeviceCandidate {
    let instance = &ctx.instance;
    let props = instance.get_physical_device_properties(phys);
    let name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let families = instance.get_physical_device_queue_family_properties(phys);
    let (graphics_family, present_family) = find_queue_families(&families, |i| {
        ctx.surface_loader
            .get_physical_device_surface_support(phys, i, ctx.surface)
            .unwrap_or(false)
    });

    let ext_props = instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_else(|e| {
            warn!("enumerate_device_extension_properties failed on {name}: {e}");
            Vec::new()
        });
    let has_swapchain_extension = ext_props
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);

    let swapchain_adequate = has_swapchain_extension
        && support_is_adequate(
            &name,
            SwapchainSupport::query(&ctx.surface_loader, phys, ctx.surface),
        );

    let features = instance.get_physical_device_features(phys);
    DeviceCandidate {
        name,
        device_type: props.device_type,
        graphics_family,
        present_family,
        has_swapchain_extension,
        swapchain_adequate,
        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
    }
}

impl DeviceContext {
    pub unsafe fn new(ctx: &InstanceContext, max_msaa_samples: u32) -> Result<Self> {
        let instance = &ctx.instance;
        let mut picked = None;
        for phys in instance
            .enumerate_physical_devices()
            .op("enumerate_physical_devices")?
        {
            let candidate = describe(ctx, phys);
            match candidate.evaluate() {
                Ok(families) => {
                    info!("selected GPU: {} ({families:?})", candidate.name);
                    picked = Some((phys, families));
                    break;
                }
                Err(why) => debug!("rejected GPU {}: {why:?}", candidate.name),
            }
        }
        let (phys, queue_families) = picked.ok_or(RenderError::NoSuitableDevice)?;

        let depth_format = choose_depth_format(|f| {
            instance
                .get_physical_device_format_properties(phys, f)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(RenderError::NoSuitableDevice)
        .context("no supported depth format")?;

        let props = instance.get_physical_device_properties(phys);
        let msaa_samples = max_usable_sample_count(
            props.limits.framebuffer_color_sample_counts
                & props.limits.framebuffer_depth_sample_counts,
            max_msaa_samples,
        );

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        };
        let device = instance
            .create_device(phys, &dinfo, None)
            .op("create_device")?;

        let graphics_queue = device.get_device_queue(queue_families.graphics, 0);
        let present_queue = device.get_device_queue(queue_families.present, 0);
        let swapchain_loader = swapchain::Device::new(instance, &device);

        info!(
            "device ready: msaa={:?} depth={:?} max_anisotropy={}",
            msaa_samples, depth_format, props.limits.max_sampler_anisotropy
        );

        Ok(Self {
            phys,
            device,
            queue_families,
            graphics_queue,
            present_queue,
            memory_properties: instance.get_physical_device_memory_properties(phys),
            msaa_samples,
            max_anisotropy: props.limits.max_sampler_anisotropy,
            depth_format,
            swapchain_loader,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.msaa_samples
    }

    pub unsafe fn destroy(&self) {
        self.device.destroy_device(None);
    }
}
