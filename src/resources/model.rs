//! Model assets
//!
//! `load_model` turns importer scene data into one GPU-resident asset with
//! flat vertex/index buffers. Two passes over the hierarchy: the count pass
//! sums vertex/index totals, detects skinning and mirrors the source tree
//! into a node arena; the fill pass copies vertex arrays into flat host
//! containers, records one draw batch per (node, mesh) pair and accumulates
//! up to four bone influences per vertex. Everything uploads through one
//! command buffer and per-array staging buffers, submitted and waited on as
//! a single batch.

use bytemuck::{Pod, Zeroable};
use glam::{IVec4, Mat4, Vec2, Vec3, Vec4};
use log::info;
use std::collections::HashMap;
use std::path::Path;

use super::import::{self, SceneData};
use super::{AssetError, Material, TextureCache};
use crate::backend::{
    BackendResult, BufferHandle, BufferObject, BufferUsage, CommandHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite, MemoryKind, RenderDevice,
    SamplerHandle,
};
use crate::pipeline::deferred::{
    GEOMETRY_BINDING_ALBEDO, GEOMETRY_BINDING_MODEL, GEOMETRY_BINDING_SCENE,
    GEOMETRY_BINDING_SPECULAR,
};
use crate::scene::{NodeArena, NodeId};

/// Hard limit on skin influences per vertex; extra influences are dropped.
pub const MAX_BONE_INFLUENCES: usize = 4;

/// Per-batch uniform block (model matrix and material scalars)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ModelMeshParams {
    pub world: Mat4,
    /// xyz = diffuse, w = shininess
    pub diffuse: Vec4,
    /// xyz = ambient
    pub ambient: Vec4,
}

/// A contiguous run of indices sharing one material
#[derive(Debug)]
pub struct DrawBatch {
    pub node: NodeId,
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub index_count: u32,
    pub material_index: usize,
    /// Arena indices of this batch's active bones, palette order
    pub bone_nodes: Vec<NodeId>,
    /// One descriptor set per swapchain image
    pub descriptor_sets: Vec<DescriptorSetHandle>,
    /// One uniform buffer per swapchain image
    pub mesh_params_ubo: Vec<BufferObject>,
    /// One bone-palette buffer per swapchain image; empty when unskinned
    pub bone_palette_ubo: Vec<BufferObject>,
}

/// A loaded model: flat GPU buffers, draw batches, materials and the node
/// hierarchy. Created once at load time, destroyed explicitly via
/// [`ModelAsset::release`] before device teardown.
pub struct ModelAsset {
    pub name: String,

    pub positions: BufferObject,
    pub normals: BufferObject,
    pub uvs: BufferObject,
    pub tangents: BufferObject,
    pub indices: BufferObject,
    pub bone_indices: Option<BufferObject>,
    pub bone_weights: Option<BufferObject>,

    pub draw_batches: Vec<DrawBatch>,
    pub materials: Vec<Material>,

    pub nodes: NodeArena,
    pub root: NodeId,
    pub inv_global_transform: Mat4,

    pub total_vertex_count: u32,
    pub total_index_count: u32,

    /// Sample-owned auxiliary buffers (e.g. transform-feedback targets),
    /// destroyed with the asset
    pub extra_buffers: HashMap<String, BufferObject>,
}

/// Flat host-side arrays produced by the two-pass traversal
struct MeshBuild {
    nodes: NodeArena,
    root: NodeId,
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    uvs: Vec<Vec2>,
    tangents: Vec<Vec3>,
    indices: Vec<u32>,
    bone_indices: Vec<IVec4>,
    bone_weights: Vec<Vec4>,
    has_bones: bool,
    batches: Vec<BatchBuild>,
    total_vertex_count: u32,
    total_index_count: u32,
}

struct BatchBuild {
    node: NodeId,
    vertex_offset: u32,
    index_offset: u32,
    index_count: u32,
    material_index: usize,
    bone_nodes: Vec<NodeId>,
}

fn add_vertex_index(v: &mut IVec4, index: i32) {
    if v.x == -1 {
        v.x = index;
        return;
    }
    if v.y == -1 {
        v.y = index;
        return;
    }
    if v.z == -1 {
        v.z = index;
        return;
    }
    if v.w == -1 {
        v.w = index;
    }
    // Fifth and later influences are dropped.
}

fn add_vertex_weight(v: &mut Vec4, weight: f32) {
    if v.x < 0.0 {
        v.x = weight;
        return;
    }
    if v.y < 0.0 {
        v.y = weight;
        return;
    }
    if v.z < 0.0 {
        v.z = weight;
        return;
    }
    if v.w < 0.0 {
        v.w = weight;
    }
}

/// Two-pass flatten of the imported scene graph.
fn flatten_scene(scene: &SceneData) -> Result<MeshBuild, AssetError> {
    // Count pass: totals, skinning detection, 1:1 node mirror.
    let mut nodes = NodeArena::new();
    let root = nodes.add(scene.root.name.clone(), None);
    nodes.get_mut(root).local_transform = scene.root.transform;

    let mut total_vertex_count = 0u32;
    let mut total_index_count = 0u32;
    let mut has_bones = false;

    let mut stack: Vec<(&import::SceneNode, NodeId)> = vec![(&scene.root, root)];
    while let Some((src, id)) = stack.pop() {
        for &mesh_index in &src.mesh_indices {
            let mesh = scene.meshes.get(mesh_index).ok_or_else(|| {
                AssetError::ModelRead(format!("mesh index {mesh_index} out of range"))
            })?;
            total_vertex_count += mesh.positions.len() as u32;
            total_index_count += mesh.indices.len() as u32;
            has_bones |= mesh.has_bones();
        }
        for child in &src.children {
            let child_id = nodes.add(child.name.clone(), Some(id));
            nodes.get_mut(child_id).local_transform = child.transform;
            stack.push((child, child_id));
        }
    }

    if total_vertex_count == 0 || total_index_count == 0 {
        return Err(AssetError::ModelRead("model has no geometry".into()));
    }

    // Fill pass: identical traversal, copying into flat containers.
    let mut positions = Vec::with_capacity(total_vertex_count as usize);
    let mut normals = Vec::with_capacity(total_vertex_count as usize);
    let mut uvs = Vec::with_capacity(total_vertex_count as usize);
    let mut tangents = Vec::with_capacity(total_vertex_count as usize);
    let mut indices = Vec::with_capacity(total_index_count as usize);
    let mut bone_indices = Vec::new();
    let mut bone_weights = Vec::new();
    if has_bones {
        bone_indices = vec![IVec4::splat(-1); total_vertex_count as usize];
        bone_weights = vec![Vec4::splat(-1.0); total_vertex_count as usize];
    }

    let mut batches = Vec::new();
    let mut running_vertex = 0u32;
    let mut running_index = 0u32;

    let mut stack: Vec<(&import::SceneNode, NodeId)> = vec![(&scene.root, root)];
    while let Some((src, id)) = stack.pop() {
        for &mesh_index in &src.mesh_indices {
            let mesh = &scene.meshes[mesh_index];
            let mut batch = BatchBuild {
                node: id,
                vertex_offset: running_vertex,
                index_offset: running_index,
                index_count: mesh.indices.len() as u32,
                material_index: mesh.material_index,
                bone_nodes: Vec::new(),
            };

            positions.extend_from_slice(&mesh.positions);
            normals.extend_from_slice(&mesh.normals);
            uvs.extend_from_slice(&mesh.uvs);
            tangents.extend_from_slice(&mesh.tangents);
            indices.extend_from_slice(&mesh.indices);

            if mesh.has_bones() {
                // Only bones that actually influence a vertex make it into
                // the palette.
                let active: Vec<&import::BoneData> = mesh
                    .bones
                    .iter()
                    .filter(|bone| !bone.weights.is_empty())
                    .collect();

                for (bone_index, bone) in active.iter().enumerate() {
                    for &(vertex, weight) in &bone.weights {
                        let v = (batch.vertex_offset + vertex) as usize;
                        add_vertex_index(&mut bone_indices[v], bone_index as i32);
                        add_vertex_weight(&mut bone_weights[v], weight);
                    }
                }

                for bone in &active {
                    let node_id = nodes.find(root, &bone.name).ok_or_else(|| {
                        AssetError::ModelRead(format!(
                            "bone '{}' has no matching hierarchy node",
                            bone.name
                        ))
                    })?;
                    nodes.get_mut(node_id).offset_matrix = bone.offset_matrix;
                    batch.bone_nodes.push(node_id);
                }
            }

            running_vertex += mesh.positions.len() as u32;
            running_index += mesh.indices.len() as u32;
            batches.push(batch);
        }

        let child_ids = nodes.get(id).children.clone();
        for (child, child_id) in src.children.iter().zip(child_ids) {
            stack.push((child, child_id));
        }
    }

    // Unfilled influence slots become zero; the zero-filled weights of every
    // vertex are expected to sum to ~1. A data-quality check on the source
    // asset, not a runtime guarantee.
    if has_bones {
        for v in &mut bone_indices {
            if v.x == -1 {
                v.x = 0;
            }
            if v.y == -1 {
                v.y = 0;
            }
            if v.z == -1 {
                v.z = 0;
            }
            if v.w == -1 {
                v.w = 0;
            }
        }
        for w in &mut bone_weights {
            if w.x < 0.0 {
                w.x = 0.0;
            }
            if w.y < 0.0 {
                w.y = 0.0;
            }
            if w.z < 0.0 {
                w.z = 0.0;
            }
            if w.w < 0.0 {
                w.w = 0.0;
            }
            let total = w.x + w.y + w.z + w.w;
            debug_assert!(
                (0.98..=1.02).contains(&total),
                "bone weights sum to {total}"
            );
        }
    }

    Ok(MeshBuild {
        nodes,
        root,
        positions,
        normals,
        uvs,
        tangents,
        indices,
        bone_indices,
        bone_weights,
        has_bones,
        batches,
        total_vertex_count,
        total_index_count,
    })
}

/// One host-visible uniform buffer per swapchain image.
pub fn create_uniform_buffers<D: RenderDevice>(
    device: &mut D,
    size: u64,
    image_count: u32,
) -> BackendResult<Vec<BufferObject>> {
    let mut buffers = Vec::with_capacity(image_count as usize);
    for _ in 0..image_count {
        buffers.push(device.create_buffer(size, BufferUsage::UNIFORM, MemoryKind::HostVisible)?);
    }
    Ok(buffers)
}

fn stage_upload<D: RenderDevice>(
    device: &mut D,
    command: CommandHandle,
    stagings: &mut Vec<BufferObject>,
    data: &[u8],
    dst: BufferHandle,
) -> Result<(), AssetError> {
    let staging = device.create_buffer(
        data.len() as u64,
        BufferUsage::TRANSFER_SRC,
        MemoryKind::HostVisible,
    )?;
    device.write_buffer(staging.handle, data)?;
    device.cmd_copy_buffer(command, staging.handle, dst, data.len() as u64);
    stagings.push(staging);
    Ok(())
}

/// Import a model file and upload it. `flip_uv` flips the V coordinate at
/// import time for sources with the opposite texture-space convention.
pub fn load_model_file<D: RenderDevice>(
    device: &mut D,
    path: impl AsRef<Path>,
    flip_uv: bool,
    textures: &mut TextureCache,
) -> Result<ModelAsset, AssetError> {
    let path = path.as_ref();
    let scene = import::load_scene(path, flip_uv)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("model")
        .to_string();
    load_model(device, &scene, &name, textures)
}

/// Build a [`ModelAsset`] from already-imported scene data.
pub fn load_model<D: RenderDevice>(
    device: &mut D,
    scene: &SceneData,
    name: &str,
    textures: &mut TextureCache,
) -> Result<ModelAsset, AssetError> {
    let image_count = device.image_count();
    let mut build = flatten_scene(scene)?;

    let vertex_usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
    let vec3_size = build.total_vertex_count as u64 * 12;
    let vec2_size = build.total_vertex_count as u64 * 8;
    let vec4_size = build.total_vertex_count as u64 * 16;

    let positions = device.create_buffer(vec3_size, vertex_usage, MemoryKind::DeviceLocal)?;
    let normals = device.create_buffer(vec3_size, vertex_usage, MemoryKind::DeviceLocal)?;
    let tangents = device.create_buffer(vec3_size, vertex_usage, MemoryKind::DeviceLocal)?;
    let uvs = device.create_buffer(vec2_size, vertex_usage, MemoryKind::DeviceLocal)?;

    let (bone_indices, bone_weights) = if build.has_bones {
        (
            Some(device.create_buffer(vec4_size, vertex_usage, MemoryKind::DeviceLocal)?),
            Some(device.create_buffer(vec4_size, vertex_usage, MemoryKind::DeviceLocal)?),
        )
    } else {
        (None, None)
    };

    let indices = device.create_buffer(
        build.total_index_count as u64 * 4,
        BufferUsage::INDEX | BufferUsage::TRANSFER_DST,
        MemoryKind::DeviceLocal,
    )?;

    // One shared command buffer, one staging buffer per array, a single
    // blocking submit, then the stagings go away.
    let command = device.allocate_command_buffer()?;
    device.begin_command_buffer(command)?;
    let mut stagings = Vec::new();

    stage_upload(
        device,
        command,
        &mut stagings,
        bytemuck::cast_slice(&build.positions),
        positions.handle,
    )?;
    stage_upload(
        device,
        command,
        &mut stagings,
        bytemuck::cast_slice(&build.normals),
        normals.handle,
    )?;
    stage_upload(
        device,
        command,
        &mut stagings,
        bytemuck::cast_slice(&build.uvs),
        uvs.handle,
    )?;
    stage_upload(
        device,
        command,
        &mut stagings,
        bytemuck::cast_slice(&build.tangents),
        tangents.handle,
    )?;
    stage_upload(
        device,
        command,
        &mut stagings,
        bytemuck::cast_slice(&build.indices),
        indices.handle,
    )?;
    if let (Some(bi), Some(bw)) = (&bone_indices, &bone_weights) {
        stage_upload(
            device,
            command,
            &mut stagings,
            bytemuck::cast_slice(&build.bone_indices),
            bi.handle,
        )?;
        stage_upload(
            device,
            command,
            &mut stagings,
            bytemuck::cast_slice(&build.bone_weights),
            bw.handle,
        )?;
    }

    device.end_command_buffer(command)?;
    device.submit_and_wait(command)?;
    device.free_command_buffer(command);
    for staging in stagings {
        device.destroy_buffer(staging.handle);
    }

    // Per-batch, per-image uniform buffers.
    let mut draw_batches = Vec::with_capacity(build.batches.len());
    for batch in build.batches.drain(..) {
        let mesh_params_ubo = create_uniform_buffers(
            device,
            std::mem::size_of::<ModelMeshParams>() as u64,
            image_count,
        )?;
        let bone_palette_ubo = if batch.bone_nodes.is_empty() {
            Vec::new()
        } else {
            create_uniform_buffers(
                device,
                batch.bone_nodes.len() as u64 * std::mem::size_of::<Mat4>() as u64,
                image_count,
            )?
        };
        draw_batches.push(DrawBatch {
            node: batch.node,
            vertex_offset: batch.vertex_offset,
            index_offset: batch.index_offset,
            index_count: batch.index_count,
            material_index: batch.material_index,
            bone_nodes: batch.bone_nodes,
            descriptor_sets: Vec::new(),
            mesh_params_ubo,
            bone_palette_ubo,
        });
    }

    // Materials: missing texture references fall back to fixed-color
    // defaults instead of failing the load.
    let mut materials = Vec::with_capacity(scene.materials.len());
    for data in &scene.materials {
        let albedo = match &data.albedo_texture {
            Some(path) => textures.load(device, path)?,
            None => textures.white(device)?,
        };
        let specular = match &data.specular_texture {
            Some(path) => textures.load(device, path)?,
            None => textures.black(device)?,
        };
        materials.push(Material {
            diffuse: data.diffuse,
            ambient: data.ambient,
            shininess: data.shininess,
            albedo,
            specular,
        });
    }

    let inv_global_transform = scene.root.transform.inverse();
    build
        .nodes
        .update_world_transforms(build.root, Mat4::IDENTITY);

    info!(
        "loaded model '{name}': {} vertices, {} indices, {} batches, {} materials",
        build.total_vertex_count,
        build.total_index_count,
        draw_batches.len(),
        materials.len()
    );

    Ok(ModelAsset {
        name: name.to_string(),
        positions,
        normals,
        uvs,
        tangents,
        indices,
        bone_indices,
        bone_weights,
        draw_batches,
        materials,
        nodes: build.nodes,
        root: build.root,
        inv_global_transform,
        total_vertex_count: build.total_vertex_count,
        total_index_count: build.total_index_count,
        extra_buffers: HashMap::new(),
    })
}

impl ModelAsset {
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.find(self.root, name)
    }

    /// Recompute world transforms top-down, once per frame from the root.
    pub fn update_transforms(&mut self) {
        self.nodes.update_world_transforms(self.root, Mat4::IDENTITY);
    }

    /// Allocate per-batch, per-image descriptor sets against the geometry
    /// layout and point them at this model's buffers and textures.
    pub fn create_descriptor_sets<D: RenderDevice>(
        &mut self,
        device: &mut D,
        layout: DescriptorSetLayoutHandle,
        scene_uniforms: &[BufferObject],
        sampler: SamplerHandle,
    ) -> BackendResult<()> {
        let materials = &self.materials;
        for batch in &mut self.draw_batches {
            let material = &materials[batch.material_index];
            batch.descriptor_sets.clear();
            for (image, scene_ubo) in scene_uniforms.iter().enumerate() {
                let set = device.allocate_descriptor_set(layout)?;
                device.update_descriptor_set(
                    set,
                    &[
                        DescriptorWrite::UniformBuffer {
                            binding: GEOMETRY_BINDING_SCENE,
                            buffer: scene_ubo.handle,
                        },
                        DescriptorWrite::UniformBuffer {
                            binding: GEOMETRY_BINDING_MODEL,
                            buffer: batch.mesh_params_ubo[image].handle,
                        },
                        DescriptorWrite::CombinedImageSampler {
                            binding: GEOMETRY_BINDING_ALBEDO,
                            texture: material.albedo.handle,
                            sampler,
                        },
                        DescriptorWrite::CombinedImageSampler {
                            binding: GEOMETRY_BINDING_SPECULAR,
                            texture: material.specular.handle,
                            sampler,
                        },
                    ],
                );
                batch.descriptor_sets.push(set);
            }
        }
        Ok(())
    }

    /// Write this image's per-batch uniform blocks from node transforms and
    /// material scalars. Safe only after the frame fence wait.
    pub fn update_mesh_params<D: RenderDevice>(
        &self,
        device: &mut D,
        image_index: u32,
    ) -> BackendResult<()> {
        for batch in &self.draw_batches {
            let material = &self.materials[batch.material_index];
            let params = ModelMeshParams {
                world: self.nodes.get(batch.node).world_transform,
                diffuse: Vec4::new(
                    material.diffuse.x,
                    material.diffuse.y,
                    material.diffuse.z,
                    material.shininess,
                ),
                ambient: Vec4::new(material.ambient.x, material.ambient.y, material.ambient.z, 0.0),
            };
            device.write_buffer(
                batch.mesh_params_ubo[image_index as usize].handle,
                bytemuck::bytes_of(&params),
            )?;
        }
        Ok(())
    }

    /// Write this image's bone palettes: inverse global transform × joint
    /// world transform × joint offset matrix, in palette order.
    pub fn update_bone_palettes<D: RenderDevice>(
        &self,
        device: &mut D,
        image_index: u32,
    ) -> BackendResult<()> {
        for batch in &self.draw_batches {
            if batch.bone_nodes.is_empty() {
                continue;
            }
            let palette: Vec<Mat4> = batch
                .bone_nodes
                .iter()
                .map(|&node| {
                    let node = self.nodes.get(node);
                    self.inv_global_transform * node.world_transform * node.offset_matrix
                })
                .collect();
            device.write_buffer(
                batch.bone_palette_ubo[image_index as usize].handle,
                bytemuck::cast_slice(&palette),
            )?;
        }
        Ok(())
    }

    /// Record draw calls for every batch: bind the shared vertex/index
    /// buffers once, then per-batch descriptor set and indexed draw.
    pub fn draw<D: RenderDevice>(
        &self,
        device: &mut D,
        command: CommandHandle,
        layout: crate::backend::PipelineLayoutHandle,
        image_index: u32,
    ) {
        device.cmd_bind_vertex_buffers(
            command,
            &[
                self.positions.handle,
                self.normals.handle,
                self.uvs.handle,
                self.tangents.handle,
            ],
        );
        device.cmd_bind_index_buffer(command, self.indices.handle);

        for batch in &self.draw_batches {
            if let Some(&set) = batch.descriptor_sets.get(image_index as usize) {
                device.cmd_bind_descriptor_set(command, layout, set);
            }
            device.cmd_draw_indexed(
                command,
                batch.index_count,
                batch.index_offset,
                batch.vertex_offset as i32,
            );
        }
    }

    /// Destroy every GPU resource this asset owns. Textures stay alive: the
    /// texture cache owns them.
    pub fn release<D: RenderDevice>(&mut self, device: &mut D) {
        device.destroy_buffer(self.positions.handle);
        device.destroy_buffer(self.normals.handle);
        device.destroy_buffer(self.uvs.handle);
        device.destroy_buffer(self.tangents.handle);
        device.destroy_buffer(self.indices.handle);
        if let Some(bi) = self.bone_indices.take() {
            device.destroy_buffer(bi.handle);
        }
        if let Some(bw) = self.bone_weights.take() {
            device.destroy_buffer(bw.handle);
        }
        for (_, buffer) in self.extra_buffers.drain() {
            device.destroy_buffer(buffer.handle);
        }
        for batch in &mut self.draw_batches {
            for set in batch.descriptor_sets.drain(..) {
                device.free_descriptor_set(set);
            }
            for ubo in batch.mesh_params_ubo.drain(..) {
                device.destroy_buffer(ubo.handle);
            }
            for ubo in batch.bone_palette_ubo.drain(..) {
                device.destroy_buffer(ubo.handle);
            }
        }
        self.draw_batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::import::{BoneData, MeshData, SceneNode};

    fn quad_mesh() -> MeshData {
        MeshData {
            positions: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            normals: vec![Vec3::Z; 4],
            uvs: vec![Vec2::ZERO; 4],
            tangents: vec![Vec3::X; 4],
            indices: vec![0, 1, 2, 2, 3, 0],
            material_index: 0,
            bones: Vec::new(),
        }
    }

    fn single_node_scene(mesh: MeshData) -> SceneData {
        SceneData {
            root: SceneNode {
                name: "ROOT".into(),
                transform: Mat4::IDENTITY,
                mesh_indices: Vec::new(),
                children: vec![SceneNode {
                    name: "quad".into(),
                    transform: Mat4::IDENTITY,
                    mesh_indices: vec![0],
                    children: Vec::new(),
                }],
            },
            meshes: vec![mesh],
            materials: vec![Default::default()],
        }
    }

    #[test]
    fn flat_mesh_produces_one_batch() {
        let build = flatten_scene(&single_node_scene(quad_mesh())).unwrap();

        assert_eq!(build.total_vertex_count, 4);
        assert_eq!(build.total_index_count, 6);
        assert!(!build.has_bones);
        assert_eq!(build.batches.len(), 1);

        let batch = &build.batches[0];
        assert_eq!(batch.vertex_offset, 0);
        assert_eq!(batch.index_offset, 0);
        assert_eq!(batch.index_count, 6);
        assert_eq!(batch.material_index, 0);
        assert!(batch.bone_nodes.is_empty());
    }

    #[test]
    fn second_mesh_gets_offsets() {
        let mut scene = single_node_scene(quad_mesh());
        scene.meshes.push(quad_mesh());
        scene.root.children[0].mesh_indices.push(1);

        let build = flatten_scene(&scene).unwrap();
        assert_eq!(build.batches.len(), 2);
        assert_eq!(build.batches[1].vertex_offset, 4);
        assert_eq!(build.batches[1].index_offset, 6);
        assert_eq!(build.positions.len(), 8);
        assert_eq!(build.indices.len(), 12);
    }

    #[test]
    fn fifth_bone_influence_is_dropped() {
        let mut mesh = quad_mesh();
        // Five bones all touching vertex 0; the four kept slots sum to 1.
        mesh.bones = (0..5)
            .map(|i| BoneData {
                name: format!("bone{i}"),
                offset_matrix: Mat4::IDENTITY,
                weights: vec![(0, if i < 4 { 0.25 } else { 0.01 })],
            })
            .collect();
        // Keep the remaining vertices fully weighted to bone 0.
        for v in 1..4 {
            mesh.bones[0].weights.push((v, 1.0));
        }

        let mut scene = single_node_scene(mesh);
        scene.root.children[0].children = (0..5)
            .map(|i| SceneNode {
                name: format!("bone{i}"),
                transform: Mat4::IDENTITY,
                mesh_indices: Vec::new(),
                children: Vec::new(),
            })
            .collect();

        let build = flatten_scene(&scene).unwrap();
        assert!(build.has_bones);

        // The first four encountered bones land in slots 0..4, in order; the
        // fifth is silently dropped.
        let indices = build.bone_indices[0];
        assert_eq!(indices, IVec4::new(0, 1, 2, 3));
        let weights = build.bone_weights[0];
        assert_eq!(weights, Vec4::new(0.25, 0.25, 0.25, 0.25));

        assert_eq!(build.batches[0].bone_nodes.len(), 5);
    }

    #[test]
    fn partial_influences_are_zero_filled_and_normalized() {
        // Four vertices with 1, 2, 3 and 4 influences, each summing to 1.
        let mut mesh = quad_mesh();
        mesh.bones = (0..4)
            .map(|i| BoneData {
                name: format!("bone{i}"),
                offset_matrix: Mat4::IDENTITY,
                weights: Vec::new(),
            })
            .collect();
        mesh.bones[0].weights = vec![(0, 1.0), (1, 0.5), (2, 0.4), (3, 0.25)];
        mesh.bones[1].weights = vec![(1, 0.5), (2, 0.3), (3, 0.25)];
        mesh.bones[2].weights = vec![(2, 0.3), (3, 0.25)];
        mesh.bones[3].weights = vec![(3, 0.25)];

        let mut scene = single_node_scene(mesh);
        scene.root.children[0].children = (0..4)
            .map(|i| SceneNode {
                name: format!("bone{i}"),
                transform: Mat4::IDENTITY,
                mesh_indices: Vec::new(),
                children: Vec::new(),
            })
            .collect();

        let build = flatten_scene(&scene).unwrap();
        for weights in &build.bone_weights {
            let total = weights.x + weights.y + weights.z + weights.w;
            assert!(
                (0.98..=1.02).contains(&total),
                "weights {weights:?} sum to {total}"
            );
            // Zero-filled slots never go negative.
            assert!(weights.min_element() >= 0.0);
        }

        // Vertex 0 has exactly one influence: weight 1 then zeros.
        assert_eq!(build.bone_weights[0], Vec4::new(1.0, 0.0, 0.0, 0.0));
        assert_eq!(build.bone_indices[0], IVec4::new(0, 0, 0, 0));
    }

    #[test]
    fn empty_scene_is_fatal() {
        let scene = SceneData::default();
        assert!(flatten_scene(&scene).is_err());
    }

    #[test]
    fn bone_without_node_is_fatal() {
        let mut mesh = quad_mesh();
        mesh.bones = vec![BoneData {
            name: "missing".into(),
            offset_matrix: Mat4::IDENTITY,
            weights: vec![(0, 1.0), (1, 1.0), (2, 1.0), (3, 1.0)],
        }];
        let scene = single_node_scene(mesh);
        assert!(flatten_scene(&scene).is_err());
    }
}
