//! Domain layer: pure business logic, types, and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod error;
pub mod event;
pub mod playbook;
pub mod status;
pub mod summary;
pub mod text;
pub mod validation;

pub use error::{AutomationError, ProvisionError};
pub use event::{InfraEvent, SuccessPayload, UndecodableEvent, decode};
pub use status::{DeletionReport, DesktopSnapshot, JobSnapshot};
