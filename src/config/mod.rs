//! Configuration management
//!
//! Node settings (data directory, address, mining and consensus parameters),
//! layered from defaults, a TOML file and the environment.

pub mod settings;

pub use settings::Config;
