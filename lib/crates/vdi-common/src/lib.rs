pub mod config;
pub mod store_keys;
pub mod types;

pub use config::{
    AppDefinition, AutomationConfig, DesktopConfig, InfraConfig, NetworkConfig,
    ProvisionerConfig, ValkeyConfig,
};
pub use store_keys::keys;
pub use types::*;
