use crate::config::models::GlobalConfig;

use std::collections::HashSet;
use std::fs;
use std::path::{ Path, PathBuf };
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration file is empty")]
    Empty,
    #[error("invalid configuration: {0}")]
    Syntax(#[from] serde_yaml::Error),
    #[error("duplicate listen address {0}")]
    DuplicateListen(String),
    #[error("location {location:?} of server {server} must begin with '/'")]
    LocationPrefix {
        server: String,
        location: String,
    },
    #[error("redirect code {0} is not a 3xx status")]
    RedirectCode(u16),
    #[error("no server blocks configured")]
    NoServers,
}

pub fn parse_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&content)
}

pub fn parse_config_str(content: &str) -> Result<GlobalConfig, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }
    let config: GlobalConfig = serde_yaml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Checks what routing relies on; everything else is taken as written.
pub fn validate(config: &GlobalConfig) -> Result<(), ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }

    let mut seen = HashSet::new();
    for server in &config.servers {
        if !seen.insert(&server.listen) {
            return Err(ConfigError::DuplicateListen(server.listen.to_string()));
        }

        if let Some(redirect) = &server.redirect {
            check_redirect(redirect.code)?;
        }

        for (prefix, location) in &server.locations {
            if !prefix.starts_with('/') {
                return Err(ConfigError::LocationPrefix {
                    server: server.listen.to_string(),
                    location: prefix.clone(),
                });
            }
            if let Some(redirect) = &location.redirect {
                check_redirect(redirect.code)?;
            }
        }
    }
    Ok(())
}

fn check_redirect(code: u16) -> Result<(), ConfigError> {
    if (300..400).contains(&code) { Ok(()) } else { Err(ConfigError::RedirectCode(code)) }
}
