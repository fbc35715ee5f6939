// Re-export main types
mod blocking;
pub mod buffer;
pub mod error;
pub mod forward;
pub mod item;
pub mod manifest;
pub mod metrics;
pub mod payload;
pub mod registry;
pub mod sweeper;

pub use buffer::{BufferConfig, BufferStats, DurableBuffer, GetOptions, Payload};
pub use error::{BufferError, Result};
pub use forward::{Transport, forward_queue};
pub use item::ItemMetadata;
pub use manifest::Manifest;
pub use metrics::BufferMetrics;
pub use payload::PayloadStore;
pub use registry::{
    BufferContext, BufferManager, FileBufferManager, global_manager, init_global_manager,
};
pub use sweeper::spawn_expiry_sweeper;
