//! Resource synchronization: caching, dirty guards, reload coalescing,
//! freshest-wins sequencing and push-driven invalidation.

mod engine;
mod optimistic;
mod push_channel;
mod push_router;
mod reload_scheduler;
mod resource_cache;
mod resource_model;
mod sequence_guard;
mod sync_config;

pub use engine::*;
pub use optimistic::*;
pub use push_channel::*;
pub use push_router::*;
pub use reload_scheduler::*;
pub use resource_cache::*;
pub use resource_model::*;
pub use sequence_guard::*;
pub use sync_config::*;

#[cfg(test)]
mod tests;
