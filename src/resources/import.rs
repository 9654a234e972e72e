//! Model importer contract and the glTF-backed source
//!
//! The engine-facing loader only consumes the plain-array types below; file
//! decoding stays behind this boundary. The glTF source flattens each
//! primitive into one [`MeshData`], remaps skin joints into per-bone weight
//! lists and resolves texture URIs relative to the model file's directory.

use glam::{Mat4, Vec2, Vec3};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::AssetError;

/// Hierarchy node as delivered by an importer
#[derive(Debug, Clone, Default)]
pub struct SceneNode {
    pub name: String,
    pub transform: Mat4,
    pub mesh_indices: Vec<usize>,
    pub children: Vec<SceneNode>,
}

/// One bone of a mesh: joint name, inverse bind matrix and raw
/// (vertex, weight) pairs.
#[derive(Debug, Clone)]
pub struct BoneData {
    pub name: String,
    pub offset_matrix: Mat4,
    pub weights: Vec<(u32, f32)>,
}

/// Flat per-primitive arrays. All vertex arrays have the same length;
/// `indices` is triangulated.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub tangents: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub material_index: usize,
    pub bones: Vec<BoneData>,
}

impl MeshData {
    pub fn has_bones(&self) -> bool {
        !self.bones.is_empty()
    }
}

/// Material scalars plus resolved texture paths (None falls back to the
/// built-in white/black textures)
#[derive(Debug, Clone)]
pub struct MaterialData {
    pub diffuse: Vec3,
    pub ambient: Vec3,
    pub shininess: f32,
    pub albedo_texture: Option<PathBuf>,
    pub specular_texture: Option<PathBuf>,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            diffuse: Vec3::ONE,
            ambient: Vec3::ZERO,
            shininess: 0.0,
            albedo_texture: None,
            specular_texture: None,
        }
    }
}

/// Everything a model file decodes to
#[derive(Debug, Clone, Default)]
pub struct SceneData {
    pub root: SceneNode,
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialData>,
}

/// Decode a glTF/GLB file into the importer contract.
///
/// An unreadable or malformed file is fatal; there is no partial result.
pub fn load_scene(path: impl AsRef<Path>, flip_uv: bool) -> Result<SceneData, AssetError> {
    let path = path.as_ref();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let (document, buffers, _images) = gltf::import(path)
        .map_err(|e| AssetError::ModelRead(format!("{}: {e}", path.display())))?;

    // Which skin drives a mesh is a property of the node instancing it.
    let mut mesh_skin: HashMap<usize, usize> = HashMap::new();
    for node in document.nodes() {
        if let (Some(mesh), Some(skin)) = (node.mesh(), node.skin()) {
            mesh_skin.entry(mesh.index()).or_insert(skin.index());
        }
    }

    // Flatten primitives; remember glTF mesh index → flat MeshData indices.
    let mut meshes = Vec::new();
    let mut mesh_index_map: Vec<Vec<usize>> = Vec::new();
    let mut used_default_material = false;
    let material_count = document.materials().count();

    for mesh in document.meshes() {
        let mut flat_indices = Vec::new();
        for primitive in mesh.primitives() {
            let reader =
                primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));

            let positions: Vec<Vec3> = reader
                .read_positions()
                .ok_or_else(|| {
                    AssetError::ModelRead(format!(
                        "mesh {} primitive without positions",
                        mesh.index()
                    ))
                })?
                .map(Vec3::from)
                .collect();
            let vertex_count = positions.len();

            let normals: Vec<Vec3> = match reader.read_normals() {
                Some(normals) => normals.map(Vec3::from).collect(),
                None => vec![Vec3::ZERO; vertex_count],
            };

            let uvs: Vec<Vec2> = match reader.read_tex_coords(0) {
                Some(uvs) => uvs
                    .into_f32()
                    .map(|[u, v]| {
                        if flip_uv {
                            Vec2::new(u, 1.0 - v)
                        } else {
                            Vec2::new(u, v)
                        }
                    })
                    .collect(),
                None => vec![Vec2::ZERO; vertex_count],
            };

            let tangents: Vec<Vec3> = match reader.read_tangents() {
                Some(tangents) => tangents.map(|[x, y, z, _w]| Vec3::new(x, y, z)).collect(),
                None => vec![Vec3::ZERO; vertex_count],
            };

            let indices: Vec<u32> = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect(),
                None => (0..vertex_count as u32).collect(),
            };

            let bones = match mesh_skin.get(&mesh.index()) {
                Some(&skin_index) => read_bones(&document, &buffers, skin_index, &reader)?,
                None => Vec::new(),
            };

            let material_index = match primitive.material().index() {
                Some(index) => index,
                None => {
                    used_default_material = true;
                    material_count
                }
            };

            flat_indices.push(meshes.len());
            meshes.push(MeshData {
                positions,
                normals,
                uvs,
                tangents,
                indices,
                material_index,
                bones,
            });
        }
        mesh_index_map.push(flat_indices);
    }

    let mut materials: Vec<MaterialData> = document
        .materials()
        .map(|material| {
            let pbr = material.pbr_metallic_roughness();
            let base = pbr.base_color_factor();
            MaterialData {
                diffuse: Vec3::new(base[0], base[1], base[2]),
                ambient: Vec3::ZERO,
                shininess: (1.0 - pbr.roughness_factor()) * 128.0,
                albedo_texture: pbr
                    .base_color_texture()
                    .and_then(|t| texture_path(&t.texture(), base_dir)),
                specular_texture: None,
            }
        })
        .collect();
    if used_default_material {
        materials.push(MaterialData::default());
    }

    // Wrap the scene roots under one artificial root node.
    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| AssetError::ModelRead(format!("{}: no scene", path.display())))?;

    let root = SceneNode {
        name: "ROOT".into(),
        transform: Mat4::IDENTITY,
        mesh_indices: Vec::new(),
        children: scene
            .nodes()
            .map(|n| load_node(&n, &mesh_index_map))
            .collect(),
    };

    Ok(SceneData {
        root,
        meshes,
        materials,
    })
}

fn load_node(node: &gltf::Node<'_>, mesh_index_map: &[Vec<usize>]) -> SceneNode {
    SceneNode {
        name: node
            .name()
            .map(String::from)
            .unwrap_or_else(|| format!("node{}", node.index())),
        transform: Mat4::from_cols_array_2d(&node.transform().matrix()),
        mesh_indices: node
            .mesh()
            .map(|m| mesh_index_map[m.index()].clone())
            .unwrap_or_default(),
        children: node
            .children()
            .map(|c| load_node(&c, mesh_index_map))
            .collect(),
    }
}

/// Turn glTF per-vertex joints/weights into per-bone (vertex, weight) lists,
/// one entry per skin joint.
fn read_bones<'a, 's, F>(
    document: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    skin_index: usize,
    reader: &gltf::mesh::Reader<'a, 's, F>,
) -> Result<Vec<BoneData>, AssetError>
where
    F: Clone + Fn(gltf::Buffer<'a>) -> Option<&'s [u8]>,
{
    let (Some(joints), Some(weights)) = (reader.read_joints(0), reader.read_weights(0)) else {
        return Ok(Vec::new());
    };

    let skin = document
        .skins()
        .nth(skin_index)
        .ok_or_else(|| AssetError::ModelRead(format!("skin {skin_index} out of range")))?;

    let joint_nodes: Vec<gltf::Node<'_>> = skin.joints().collect();
    let skin_reader = skin.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));
    let inverse_bind: Vec<Mat4> = match skin_reader.read_inverse_bind_matrices() {
        Some(matrices) => matrices.map(|m| Mat4::from_cols_array_2d(&m)).collect(),
        None => vec![Mat4::IDENTITY; joint_nodes.len()],
    };

    let mut bones: Vec<BoneData> = joint_nodes
        .iter()
        .enumerate()
        .map(|(i, node)| BoneData {
            name: node
                .name()
                .map(String::from)
                .unwrap_or_else(|| format!("node{}", node.index())),
            offset_matrix: inverse_bind.get(i).copied().unwrap_or(Mat4::IDENTITY),
            weights: Vec::new(),
        })
        .collect();

    for (vertex, (joints, weights)) in joints
        .into_u16()
        .zip(weights.into_f32())
        .enumerate()
    {
        for (joint, weight) in joints.iter().zip(weights.iter()) {
            if *weight > 0.0 {
                if let Some(bone) = bones.get_mut(*joint as usize) {
                    bone.weights.push((vertex as u32, *weight));
                }
            }
        }
    }

    Ok(bones)
}

fn texture_path(texture: &gltf::Texture<'_>, base_dir: &Path) -> Option<PathBuf> {
    match texture.source().source() {
        gltf::image::Source::Uri { uri, .. } => {
            // Embedded data URIs fall back to the default textures.
            if uri.starts_with("data:") {
                None
            } else {
                Some(base_dir.join(uri))
            }
        }
        gltf::image::Source::View { .. } => None,
    }
}
