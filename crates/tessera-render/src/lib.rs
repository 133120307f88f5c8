// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::hash::{Hash, Hasher};

pub use tessera_math::FrameUniforms;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// One mesh vertex as laid out in the vertex buffer (binding 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

// -0.0 and 0.0 compare equal as floats, so they share one key.
fn float_key(f: f32) -> u32 {
    if f == 0.0 {
        0
    } else {
        f.to_bits()
    }
}

impl Vertex {
    fn bits(&self) -> [u32; 8] {
        [
            self.pos[0],
            self.pos[1],
            self.pos[2],
            self.color[0],
            self.color[1],
            self.color[2],
            self.tex_coord[0],
            self.tex_coord[1],
        ]
        .map(float_key)
    }
}

// Exact equality on the component bit patterns so vertices can key a hash map.
impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// Unique vertices plus the index list that rebuilds every triangle corner.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Decoded RGBA8 pixels, tightly packed rows.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub vsync_mode: VsyncMode,
    pub max_msaa_samples: u32,
    pub validation: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            vsync_mode: VsyncMode::Mailbox,
            max_msaa_samples: 8,
            validation: cfg!(debug_assertions),
        }
    }
}

/// What the renderer needs from the window while it rebuilds the swapchain.
pub trait DrawableSurface {
    /// Current framebuffer size in pixels; zero while minimised.
    fn drawable_size(&self) -> RenderSize;
    /// Blocks until at least one window event has been processed.
    fn wait_events(&mut self);
    /// True once the user asked to close; stops waits for a nonzero size.
    fn close_requested(&self) -> bool {
        false
    }
    /// The swapchain was just rebuilt at the current size, so resize
    /// notices queued before this point are stale.
    fn resize_handled(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Work was submitted and the image handed to the presentation engine.
    Presented,
    /// The surface went out of date on acquire; the swapchain was rebuilt
    /// and nothing was submitted.
    Skipped,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        mesh: &MeshData,
        texture: &TextureData,
        settings: &RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    fn render(
        &mut self,
        surface: &mut dyn DrawableSurface,
        resized: bool,
        uniforms: &FrameUniforms,
    ) -> Result<FrameStatus>;
    fn extent(&self) -> RenderSize;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn wait_idle(&self) -> Result<()>;
}
