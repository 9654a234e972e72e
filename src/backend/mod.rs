//! GPU backend abstraction and the Vulkan implementation

pub mod traits;
pub mod types;
pub mod vulkan;

pub use traits::*;
pub use types::*;
