//! Consumed interfaces and their adapters
//!
//! Everything the placement engine talks to lives behind the traits in
//! this layer: the hardware snapshot, the container cache and the
//! memory allocator library.

pub mod annotations;
pub mod cache;
pub mod memory;
pub mod mock;
pub mod system;

pub use cache::{Cache, Container, FileBlobStore};
pub use memory::{LinearMemAllocator, MemAllocator, MemTypeMask, NodeMask, Offer};
pub use system::{MemoryType, NodeId, System};
