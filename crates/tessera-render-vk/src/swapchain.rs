// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain and everything sized to it.
//!
//! [`SwapchainManager`] owns the rebuild protocol; [`SwapchainFactory`]
//! does the device work. The Vulkan factory lives here too; tests drive the
//! manager with counting factories.

use anyhow::{Context, Result};
use ash::vk;
use tessera_render::{DrawableSurface, RenderSize, VsyncMode};
use tracing::{debug, info, warn};

use crate::device::{QueueFamilyIndices, SwapchainSupport};
use crate::error::VkResultExt;
use crate::resources::{create_image_view, GpuImage, ImageDesc, Transfer};
use crate::transition::{aspect_mask, transition};

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = formats.iter().copied().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB
            && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    if preferred.is_none() && !formats.is_empty() {
        warn!("B8G8R8A8_SRGB/SRGB_NONLINEAR unavailable, using {:?}", formats[0]);
    }
    preferred.or_else(|| formats.first().copied())
}

/// MAILBOX when asked for and available, otherwise FIFO (always supported).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: VsyncMode) -> vk::PresentModeKHR {
    match vsync {
        VsyncMode::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        VsyncMode::Mailbox => {
            warn!("MAILBOX present mode unavailable, falling back to FIFO");
            vk::PresentModeKHR::FIFO
        }
        VsyncMode::Fifo => vk::PresentModeKHR::FIFO,
    }
}

/// The surface's current extent, or the drawable size clamped into the
/// surface bounds when the current extent is the `u32::MAX` sentinel.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum; a zero maximum means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

/// Concurrent across both families when they differ, so no ownership
/// transfer barriers are needed.
pub fn sharing_mode(families: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if families.graphics != families.present {
        (vk::SharingMode::CONCURRENT, families.unique())
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// Blocks on window events until the drawable size is nonzero.
/// `None` if the window is closed first.
fn wait_for_drawable<S: DrawableSurface + ?Sized>(surface: &mut S) -> Option<RenderSize> {
    let mut size = surface.drawable_size();
    while size.is_zero() {
        if surface.close_requested() {
            return None;
        }
        surface.wait_events();
        size = surface.drawable_size();
    }
    Some(size)
}

/// Device-side half of the rebuild protocol.
pub trait SwapchainFactory {
    type Chain;

    /// Drains every in-flight GPU operation.
    fn wait_idle(&mut self) -> Result<()>;
    fn create(&mut self, size: RenderSize) -> Result<Self::Chain>;
    fn destroy(&mut self, chain: Self::Chain);
}

pub struct SwapchainManager<F: SwapchainFactory> {
    factory: F,
    chain: Option<F::Chain>,
    generation: u64,
}

impl<F: SwapchainFactory> SwapchainManager<F> {
    /// Builds the first chain. A zero size (window starts minimised) defers
    /// it: the manager starts empty and the first `recreate` waits for a
    /// nonzero drawable size.
    pub fn new(mut factory: F, size: RenderSize) -> Result<Self> {
        let chain = if size.is_zero() {
            info!("drawable size is zero at startup, deferring the first swapchain");
            None
        } else {
            Some(factory.create(size).context("initial swapchain")?)
        };
        Ok(Self {
            factory,
            chain,
            generation: 0,
        })
    }

    /// Tears down the current chain and builds a new one for the current
    /// drawable size. Blocks on window events while that size is zero; a
    /// close request during that wait keeps the old chain.
    pub fn recreate<S: DrawableSurface + ?Sized>(&mut self, surface: &mut S) -> Result<()> {
        let Some(size) = wait_for_drawable(surface) else {
            info!("close requested while minimised, skipping swapchain rebuild");
            return Ok(());
        };

        self.factory.wait_idle()?;
        if let Some(old) = self.chain.take() {
            self.factory.destroy(old);
        }
        self.chain = Some(self.factory.create(size).context("recreate swapchain")?);
        self.generation += 1;
        surface.resize_handled();
        debug!("swapchain generation {}", self.generation);
        Ok(())
    }

    /// Builds the chain if there is none yet. Returns `true` when a chain
    /// was already live, `false` when this call had to build (or, on close,
    /// skip building) one.
    pub fn ensure_chain<S: DrawableSurface + ?Sized>(&mut self, surface: &mut S) -> Result<bool> {
        if self.chain.is_some() {
            return Ok(true);
        }
        self.recreate(surface)?;
        Ok(false)
    }

    /// `None` before the first nonzero-size build, after a failed rebuild,
    /// or after `destroy`.
    pub fn chain(&self) -> Option<&F::Chain> {
        self.chain.as_ref()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drains the device and releases the live chain, if any.
    pub fn destroy(&mut self) {
        if let Some(chain) = self.chain.take() {
            if let Err(e) = self.factory.wait_idle() {
                warn!("wait_idle before swapchain teardown failed: {e:#}");
            }
            self.factory.destroy(chain);
        }
    }
}

/// A built chain: swapchain images and views, the multisampled colour and
/// depth targets, and one framebuffer per image.
pub struct Swapchain {
    pub(crate) handle: vk::SwapchainKHR,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) views: Vec<vk::ImageView>,
    pub(crate) extent: vk::Extent2D,
    pub(crate) present_mode: vk::PresentModeKHR,
    pub(crate) color: GpuImage,
    pub(crate) depth: GpuImage,
    pub(crate) framebuffers: Vec<vk::Framebuffer>,
}

impl Swapchain {
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

pub struct VkSwapchainFactory {
    pub(crate) transfer: Transfer,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
    pub(crate) surface_loader: ash::khr::surface::Instance,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) queue_families: QueueFamilyIndices,
    /// Fixed at startup so the render pass stays compatible across rebuilds.
    pub(crate) surface_format: vk::SurfaceFormatKHR,
    pub(crate) depth_format: vk::Format,
    pub(crate) msaa_samples: vk::SampleCountFlags,
    pub(crate) vsync: VsyncMode,
    pub(crate) render_pass: vk::RenderPass,
}

impl VkSwapchainFactory {
    unsafe fn build(&self, size: RenderSize) -> Result<Swapchain> {
        let device = &self.transfer.device;
        let support = SwapchainSupport::query(&self.surface_loader, self.phys, self.surface)?;
        let caps = &support.capabilities;
        let present_mode = choose_present_mode(&support.present_modes, self.vsync);
        let extent = choose_extent(caps, size);
        let min_image_count = choose_image_count(caps);
        let (image_sharing_mode, family_list) = sharing_mode(&self.queue_families);

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface,
            min_image_count,
            image_format: self.surface_format.format,
            image_color_space: self.surface_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode,
            queue_family_index_count: family_list.len() as u32,
            p_queue_family_indices: family_list.as_ptr(),
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        let handle = self
            .swapchain_loader
            .create_swapchain(&info, None)
            .op("create_swapchain")?;
        let images = self
            .swapchain_loader
            .get_swapchain_images(handle)
            .op("get_swapchain_images")?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            views.push(create_image_view(
                device,
                image,
                self.surface_format.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?);
        }

        let mut color = GpuImage::new(
            device,
            &self.transfer.memory_props,
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                samples: self.msaa_samples,
                format: self.surface_format.format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;
        color.create_view(device, vk::ImageAspectFlags::COLOR)?;

        let mut depth = GpuImage::new(
            device,
            &self.transfer.memory_props,
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                samples: self.msaa_samples,
                format: self.depth_format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;
        depth.create_view(device, aspect_mask(self.depth_format))?;
        self.transfer.run(|shot| {
            transition(shot, &mut depth, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)?;
            Ok(())
        })?;

        let mut framebuffers = Vec::with_capacity(views.len());
        for &view in &views {
            // Order matches the render pass: colour, depth, resolve.
            let attachments = [color.view, depth.view, view];
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: self.render_pass,
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            framebuffers.push(
                device
                    .create_framebuffer(&fb_info, None)
                    .op("create_framebuffer")?,
            );
        }

        info!(
            "swapchain built: {:?}/{:?} {:?} {}x{} images={}",
            self.surface_format.format,
            self.surface_format.color_space,
            present_mode,
            extent.width,
            extent.height,
            images.len()
        );

        Ok(Swapchain {
            handle,
            images,
            views,
            extent,
            present_mode,
            color,
            depth,
            framebuffers,
        })
    }
}

impl SwapchainFactory for VkSwapchainFactory {
    type Chain = Swapchain;

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.transfer.device.device_wait_idle() }.op("device_wait_idle")?;
        Ok(())
    }

    fn create(&mut self, size: RenderSize) -> Result<Swapchain> {
        unsafe { self.build(size) }
    }

    fn destroy(&mut self, chain: Swapchain) {
        let device = &self.transfer.device;
        unsafe {
            for fb in chain.framebuffers {
                device.destroy_framebuffer(fb, None);
            }
            chain.color.destroy(device);
            chain.depth.destroy(device);
            for view in chain.views {
                device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(chain.handle, None);
        }
        debug!("swapchain destroyed ({:?})", chain.present_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn unconstrained_extent_uses_drawable_size() {
        let c = caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096));
        let e = choose_extent(
            &c,
            RenderSize {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!((e.width, e.height), (1280, 720));
    }

    #[test]
    fn unconstrained_extent_clamps_to_limits() {
        let c = caps((u32::MAX, u32::MAX), (200, 100), (1920, 1080));
        let e = choose_extent(
            &c,
            RenderSize {
                width: 4000,
                height: 10,
            },
        );
        assert_eq!((e.width, e.height), (1920, 100));
    }

    #[test]
    fn defined_current_extent_wins() {
        let c = caps((800, 600), (1, 1), (4096, 4096));
        let e = choose_extent(
            &c,
            RenderSize {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let mut c = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);
        c.max_image_count = 8;
        assert_eq!(choose_image_count(&c), 3);
    }

    #[test]
    fn surface_format_prefers_bgra_srgb_nonlinear() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let picked = choose_surface_format(&formats).unwrap();
        assert_eq!(
            (picked.format, picked.color_space),
            (vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_prefers_mailbox_then_fifo() {
        let both = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let fifo_only = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&both, VsyncMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&fifo_only, VsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&both, VsyncMode::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn sharing_is_concurrent_only_across_families() {
        let same = QueueFamilyIndices {
            graphics: 0,
            present: 0,
        };
        assert_eq!(sharing_mode(&same), (vk::SharingMode::EXCLUSIVE, vec![]));
        let split = QueueFamilyIndices {
            graphics: 0,
            present: 2,
        };
        assert_eq!(sharing_mode(&split), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    struct Minimised {
        waits: u32,
        size: RenderSize,
        resize_pending: bool,
    }

    impl Minimised {
        fn restoring_to(size: RenderSize) -> Self {
            Self {
                waits: 0,
                size,
                resize_pending: false,
            }
        }
    }

    impl DrawableSurface for Minimised {
        fn drawable_size(&self) -> RenderSize {
            if self.waits < 3 {
                RenderSize {
                    width: 0,
                    height: 0,
                }
            } else {
                self.size
            }
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            // Restoring a window queues resize events while we block.
            self.resize_pending = true;
        }

        fn resize_handled(&mut self) {
            self.resize_pending = false;
        }
    }

    #[derive(Default)]
    struct SizeLog {
        created: Vec<RenderSize>,
        destroyed: usize,
    }

    impl SwapchainFactory for SizeLog {
        type Chain = RenderSize;

        fn wait_idle(&mut self) -> Result<()> {
            Ok(())
        }

        fn create(&mut self, size: RenderSize) -> Result<RenderSize> {
            self.created.push(size);
            Ok(size)
        }

        fn destroy(&mut self, _chain: RenderSize) {
            self.destroyed += 1;
        }
    }

    struct ClosedWhileMinimised;

    impl DrawableSurface for ClosedWhileMinimised {
        fn drawable_size(&self) -> RenderSize {
            RenderSize {
                width: 0,
                height: 0,
            }
        }

        fn wait_events(&mut self) {
            panic!("must not block once close was requested");
        }

        fn close_requested(&self) -> bool {
            true
        }
    }

    #[test]
    fn close_during_minimise_keeps_old_chain() {
        let start = RenderSize {
            width: 640,
            height: 480,
        };
        let mut mgr = SwapchainManager::new(SizeLog::default(), start).unwrap();
        mgr.recreate(&mut ClosedWhileMinimised).unwrap();
        assert_eq!(mgr.chain(), Some(&start));
        assert_eq!(mgr.factory().destroyed, 0);
        assert_eq!(mgr.generation(), 0);
    }

    #[test]
    fn recreate_waits_out_minimised_window() {
        let start = RenderSize {
            width: 640,
            height: 480,
        };
        let mut mgr = SwapchainManager::new(SizeLog::default(), start).unwrap();
        let mut surface = Minimised::restoring_to(RenderSize {
            width: 1024,
            height: 768,
        });
        mgr.recreate(&mut surface).unwrap();
        assert_eq!(surface.waits, 3);
        assert!(!surface.resize_pending, "rebuild leaves no stale resize");
        assert_eq!(mgr.factory().created, vec![start, surface.size]);
        assert_eq!(mgr.factory().destroyed, 1);
        assert_eq!(mgr.chain(), Some(&surface.size));
        assert_eq!(mgr.generation(), 1);
    }

    #[test]
    fn minimised_startup_defers_first_chain() {
        let zero = RenderSize {
            width: 0,
            height: 0,
        };
        let mut mgr = SwapchainManager::new(SizeLog::default(), zero).unwrap();
        assert!(mgr.chain().is_none());
        assert!(mgr.factory().created.is_empty());

        let restored = RenderSize {
            width: 800,
            height: 600,
        };
        let mut surface = Minimised::restoring_to(restored);
        assert!(!mgr.ensure_chain(&mut surface).unwrap());
        assert_eq!(surface.waits, 3);
        assert_eq!(mgr.factory().created, vec![restored]);
        assert_eq!(mgr.factory().destroyed, 0);
        assert_eq!(mgr.chain(), Some(&restored));

        assert!(mgr.ensure_chain(&mut surface).unwrap());
        assert_eq!(mgr.factory().created.len(), 1);
    }

    #[test]
    fn closed_before_first_chain_builds_nothing() {
        let zero = RenderSize {
            width: 0,
            height: 0,
        };
        let mut mgr = SwapchainManager::new(SizeLog::default(), zero).unwrap();
        assert!(!mgr.ensure_chain(&mut ClosedWhileMinimised).unwrap());
        assert!(mgr.chain().is_none());
        assert!(mgr.factory().created.is_empty());
    }
}
