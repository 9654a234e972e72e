//! Model materials

use glam::Vec3;

use crate::backend::ImageObject;

/// Material scalars plus the two resolved textures.
///
/// The texture images are owned by the process-wide [`super::TextureCache`];
/// a material only aliases them and must not destroy them.
#[derive(Debug, Clone)]
pub struct Material {
    pub diffuse: Vec3,
    pub ambient: Vec3,
    pub shininess: f32,
    pub albedo: ImageObject,
    pub specular: ImageObject,
}
