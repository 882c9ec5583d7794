pub mod models;
pub mod parser;

pub use models::{ GlobalConfig, Listen, LocationConfig, Redirect, ServerConfig };
pub use parser::{ parse_config, parse_config_str, ConfigError };
