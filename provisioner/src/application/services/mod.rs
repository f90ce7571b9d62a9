//! Application services: use-case orchestration.
//!
//! Each service module implements a single use-case by composing domain logic
//! with port trait calls. Services import only from `crate::domain` and
//! `crate::application::ports`, never from `crate::infra`, `crate::commands`,
//! or `crate::output`.

pub mod automation;
pub mod decommission;
pub mod event_listener;
pub mod infra_tasks;
pub mod orchestrator;
pub mod port_allocator;
pub mod process_registry;
pub mod signal_bus;
pub mod timeout_tracker;
