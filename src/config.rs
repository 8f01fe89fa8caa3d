use std::path::PathBuf;

use crate::error::ConfigError;

/// Settings for the self-hosted backend binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    pub base_path: String,
    pub anon_key: String,
    pub confirm_email: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_port = lookup("TODOLISTS_PORT").ok_or(ConfigError::Missing("TODOLISTS_PORT"))?;
        let port = raw_port.parse().map_err(|_| ConfigError::Invalid {
            name: "TODOLISTS_PORT",
            value: raw_port.clone(),
        })?;

        let anon_key = lookup("TODOLISTS_ANON_KEY")
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("TODOLISTS_ANON_KEY"))?;

        let confirm_email = match lookup("TODOLISTS_CONFIRM_EMAIL").as_deref() {
            None | Some("") | Some("false") | Some("0") => false,
            Some("true") | Some("1") => true,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "TODOLISTS_CONFIRM_EMAIL",
                    value: other.to_string(),
                })
            }
        };

        Ok(ServerConfig {
            port,
            db_path: lookup("TODOLISTS_DB").unwrap_or_else(|| "todolists.db".to_string()),
            base_path: lookup("TODOLISTS_BASE_PATH")
                .map(|p| normalize_base_path(&p))
                .unwrap_or_default(),
            anon_key,
            confirm_email,
        })
    }
}

/// Leading slash, no trailing slash, empty for the root.
pub fn normalize_base_path(path: &str) -> String {
    let path = path.trim_end_matches('/');
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub anon_key: String,
}

/// Settings for an embedding client of the core.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub storage_path: PathBuf,
    pub remote: Option<RemoteConfig>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let storage_path = lookup("TODOLISTS_STORAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("todolists-local.db"));

        let remote = match (lookup("TODOLISTS_REMOTE_URL"), lookup("TODOLISTS_ANON_KEY")) {
            (Some(url), Some(anon_key)) if !url.is_empty() && !anon_key.is_empty() => {
                Some(RemoteConfig { url, anon_key })
            }
            _ => None,
        };

        ClientConfig {
            storage_path,
            remote,
        }
    }
}
