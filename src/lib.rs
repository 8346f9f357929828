pub mod apps;
pub mod config;
pub mod controller;
pub mod error;
pub mod feature_flags;
pub mod logger;
pub mod plugin;
pub mod schema;
pub mod service_discovery;
