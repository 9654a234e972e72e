//! Texture loading and the process-wide texture cache
//!
//! Textures are deduplicated by file path: the first load decodes and
//! uploads, later loads return the cached image. The cache owns every image
//! it hands out and tears all of them down at shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use super::AssetError;
use crate::backend::{
    BufferUsage, ImageObject, MemoryKind, RenderDevice, TextureFormat, TextureUsage,
};

#[derive(Default)]
pub struct TextureCache {
    textures: HashMap<PathBuf, ImageObject>,
    white: Option<ImageObject>,
    black: Option<ImageObject>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a texture file (RGBA8), uploading through a staging buffer on
    /// first use.
    pub fn load<D: RenderDevice>(
        &mut self,
        device: &mut D,
        path: &Path,
    ) -> Result<ImageObject, AssetError> {
        if let Some(&texture) = self.textures.get(path) {
            return Ok(texture);
        }

        let image = image::open(path)
            .map_err(|e| AssetError::ImageDecode(format!("{}: {e}", path.display())))?
            .to_rgba8();
        let (width, height) = image.dimensions();
        let texture = upload_pixels(device, width, height, image.as_raw())?;

        debug!("loaded texture {} ({width}x{height})", path.display());
        self.textures.insert(path.to_path_buf(), texture);
        Ok(texture)
    }

    /// 1×1 white fallback for missing diffuse textures.
    pub fn white<D: RenderDevice>(&mut self, device: &mut D) -> Result<ImageObject, AssetError> {
        if let Some(white) = self.white {
            return Ok(white);
        }
        let white = upload_pixels(device, 1, 1, &[255, 255, 255, 255])?;
        self.white = Some(white);
        Ok(white)
    }

    /// 1×1 black fallback for missing specular textures.
    pub fn black<D: RenderDevice>(&mut self, device: &mut D) -> Result<ImageObject, AssetError> {
        if let Some(black) = self.black {
            return Ok(black);
        }
        let black = upload_pixels(device, 1, 1, &[0, 0, 0, 255])?;
        self.black = Some(black);
        Ok(black)
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Destroy every cached image. Must run before device teardown.
    pub fn cleanup<D: RenderDevice>(&mut self, device: &mut D) {
        for (_, texture) in self.textures.drain() {
            device.destroy_texture(texture.handle);
        }
        if let Some(white) = self.white.take() {
            device.destroy_texture(white.handle);
        }
        if let Some(black) = self.black.take() {
            device.destroy_texture(black.handle);
        }
    }
}

/// One-shot upload: staging buffer → image, submitted and waited on
/// immediately. Load-time only.
pub fn upload_pixels<D: RenderDevice>(
    device: &mut D,
    width: u32,
    height: u32,
    rgba: &[u8],
) -> Result<ImageObject, AssetError> {
    let texture = device.create_texture(
        width,
        height,
        TextureFormat::Rgba8Unorm,
        TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST,
    )?;

    let staging = device.create_buffer(
        rgba.len() as u64,
        BufferUsage::TRANSFER_SRC,
        MemoryKind::HostVisible,
    )?;
    device.write_buffer(staging.handle, rgba)?;

    let command = device.allocate_command_buffer()?;
    device.begin_command_buffer(command)?;
    device.cmd_copy_buffer_to_texture(command, staging.handle, texture.handle, width, height);
    device.end_command_buffer(command)?;
    device.submit_and_wait(command)?;
    device.free_command_buffer(command);

    device.destroy_buffer(staging.handle);
    Ok(texture)
}
