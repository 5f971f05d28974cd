pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{default_config_path, load};
pub use types::{CacheConfig, Config};
