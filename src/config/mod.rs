pub mod schema;

pub use schema::{resolve_config_dir, CommsConfig, Config, DeliveryStrategy, ObservabilityConfig};
