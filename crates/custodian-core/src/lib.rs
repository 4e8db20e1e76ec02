//! Decision and orchestration core for custodian
//!
//! This crate contains:
//! - Sensor cache (per-field TTLs, explicit invalidation, forced refresh)
//! - Condition evaluator (pure rules -> desired run state)
//! - Action orchestrator (launch, graceful quit, forced kill, verification)
//! - Event scheduler (debounced evaluation, minimum action gap)
//! - Runtime hook manager (event sources and the safety timer)
//! - The controller that owns all of the above

mod cache;
mod controller;
mod evaluator;
mod events;
mod hooks;
mod orchestrator;
mod scheduler;
mod state;

pub use cache::*;
pub use controller::*;
pub use evaluator::*;
pub use events::*;
pub use hooks::*;
pub use orchestrator::*;
pub use scheduler::*;
pub use state::*;
