//! Asset loading and GPU resource ownership

pub mod import;
pub mod material;
pub mod model;
pub mod texture;

pub use material::Material;
pub use model::{DrawBatch, ModelAsset, ModelMeshParams};
pub use texture::TextureCache;

use thiserror::Error;

/// Asset pipeline error type. Malformed scene data is fatal: the loader
/// never returns a partial asset.
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Failed to read model: {0}")]
    ModelRead(String),
    #[error("Failed to decode image: {0}")]
    ImageDecode(String),
    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),
}
