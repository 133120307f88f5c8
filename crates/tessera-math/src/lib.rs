// SPDX-License-Identifier: CEPL-1.0
//! Per-frame transform block shared by the renderer and the app.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

pub use glam;

/// Model, view and projection matrices in the layout the vertex shader
/// declares at set 0, binding 0 (three column-major `mat4`).
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl FrameUniforms {
    pub fn from_matrices(model: Mat4, view: Mat4, proj: Mat4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
        }
    }

    pub fn identity() -> Self {
        Self::from_matrices(Mat4::IDENTITY, Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

const TURN_RATE_DEG_PER_SEC: f32 = 90.0;
const FOV_Y_DEG: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 10.0;

/// Spins the model about +Z, looking down from (2, 2, 2).
///
/// The projection is flipped on Y because Vulkan clip space points +Y down;
/// depth lands in `[0, 1]`.
pub fn spin_uniforms(elapsed_secs: f32, width: u32, height: u32) -> FrameUniforms {
    let model = Mat4::from_rotation_z((elapsed_secs * TURN_RATE_DEG_PER_SEC).to_radians());
    let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

    let aspect = width as f32 / height.max(1) as f32;
    let mut proj = Mat4::perspective_rh(FOV_Y_DEG.to_radians(), aspect, Z_NEAR, Z_FAR);
    proj.y_axis.y *= -1.0;

    FrameUniforms::from_matrices(model, view, proj)
}
