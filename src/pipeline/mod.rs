//! Render pipelines built on the scaffold

pub mod deferred;

/// Render-pass registry keys used by the built-in pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    /// Three-subpass deferred pass (depth prepass → G-buffer → lighting)
    Deferred,
    /// Non-clearing pass over backbuffer+depth for UI injection
    Overlay,
}

/// Layout registry keys. The descriptor-set layout and pipeline layout
/// registries are separate namespaces, so both use these keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutId {
    /// Scene UBO + model UBO + albedo/specular samplers (geometry passes)
    Geometry,
    /// Scene UBO + three G-buffer input attachments (lighting subpass)
    DeferredLighting,
}
