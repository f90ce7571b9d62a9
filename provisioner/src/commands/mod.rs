//! Command implementations

pub mod delete;
pub mod install;
pub mod logs;
pub mod provision;
pub mod status;
pub mod version;
