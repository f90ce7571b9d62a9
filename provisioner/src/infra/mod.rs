//! Infrastructure layer: concrete implementations of application port traits.
//!
//! This module contains all I/O-performing code: process execution, ssh to
//! the automation host, the provider HTTP client, Valkey persistence and the
//! event stream consumer.
//!
//! Imports from `crate::domain` and `crate::application::ports` are allowed.
//! Imports from `crate::commands` or `crate::output` are forbidden.

pub mod clock;
pub mod command_runner;
pub mod config;
pub mod event_stream;
pub mod http_infra;
pub mod memory_store;
pub mod network;
pub mod ssh_host;
pub mod valkey_store;
