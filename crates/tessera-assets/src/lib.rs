// SPDX-License-Identifier: CEPL-1.0
//! Model and texture loading.
//!
//! Produces the flat arrays the renderer uploads: deduplicated vertices with a
//! matching index list, and tightly packed RGBA8 pixels.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use tessera_render::{MeshData, TextureData, Vertex};
use tracing::info;

const WHITE: [f32; 3] = [1.0, 1.0, 1.0];

fn obj_load_options() -> tobj::LoadOptions {
    tobj::LoadOptions {
        single_index: true,
        triangulate: true,
        ..Default::default()
    }
}

pub fn load_mesh(path: &Path) -> Result<MeshData> {
    let (models, _materials) = tobj::load_obj(path, &obj_load_options())
        .with_context(|| format!("load_obj {}", path.display()))?;
    let mesh = mesh_from_models(&models);
    info!(
        "model {}: {} unique vertices, {} indices",
        path.display(),
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

/// Parses OBJ text from any reader; material libraries are ignored.
pub fn mesh_from_obj_reader<R: BufRead>(reader: &mut R) -> Result<MeshData> {
    let (models, _materials) =
        tobj::load_obj_buf(reader, &obj_load_options(), |_| Ok(Default::default()))
            .context("load_obj_buf")?;
    Ok(mesh_from_models(&models))
}

fn mesh_from_models(models: &[tobj::Model]) -> MeshData {
    let corners = models.iter().flat_map(|model| {
        let mesh = &model.mesh;
        mesh.indices.iter().map(move |&index| {
            let p = 3 * index as usize;
            let t = 2 * index as usize;
            let tex_coord = if mesh.texcoords.len() >= t + 2 {
                // OBJ puts v = 0 at the bottom; images start at the top row.
                [mesh.texcoords[t], 1.0 - mesh.texcoords[t + 1]]
            } else {
                [0.0, 0.0]
            };
            Vertex {
                pos: [
                    mesh.positions[p],
                    mesh.positions[p + 1],
                    mesh.positions[p + 2],
                ],
                color: WHITE,
                tex_coord,
            }
        })
    });
    dedup_vertices(corners)
}

/// Collapses identical face corners into one vertex each.
///
/// Every corner pushes exactly one index; a vertex is appended only the
/// first time its (position, color, texcoord) tuple is seen.
pub fn dedup_vertices<I>(corners: I) -> MeshData
where
    I: IntoIterator<Item = Vertex>,
{
    let mut unique: HashMap<Vertex, u32> = HashMap::new();
    let mut mesh = MeshData::default();

    for vertex in corners {
        let index = *unique.entry(vertex).or_insert_with(|| {
            mesh.vertices.push(vertex);
            (mesh.vertices.len() - 1) as u32
        });
        mesh.indices.push(index);
    }
    mesh
}

/// Re-expands an indexed mesh into its per-corner vertex list.
pub fn expand_indices(mesh: &MeshData) -> Vec<Vertex> {
    mesh.indices
        .iter()
        .map(|&i| mesh.vertices[i as usize])
        .collect()
}

pub fn load_texture(path: &Path) -> Result<TextureData> {
    let img = image::open(path)
        .with_context(|| format!("open texture {}", path.display()))?
        .into_rgba8();
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(anyhow!("texture {} has no pixels", path.display()));
    }
    info!("texture {}: {}x{}", path.display(), width, height);
    Ok(TextureData {
        width,
        height,
        pixels: img.into_raw(),
    })
}
