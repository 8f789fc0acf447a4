use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::NmdcError;

pub const ENV_VAR: &str = "NMDC_ENV";
pub const CACHE_PATH_VAR: &str = "NMDC_LINK_CACHE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ApiEnvironment {
    #[default]
    Prod,
    Dev,
    Backup,
}

impl ApiEnvironment {
    pub fn base_url(self) -> &'static str {
        match self {
            ApiEnvironment::Prod => "https://api.microbiomedata.org",
            ApiEnvironment::Dev => "https://api-dev.microbiomedata.org",
            ApiEnvironment::Backup => "https://api-backup.microbiomedata.org",
        }
    }

    /// Data portal host serving functional biosample search. The backup
    /// environment has none.
    pub fn data_base_url(self) -> Option<&'static str> {
        match self {
            ApiEnvironment::Prod => Some("https://data.microbiomedata.org"),
            ApiEnvironment::Dev => Some("https://data-dev.microbiomedata.org"),
            ApiEnvironment::Backup => None,
        }
    }

    /// Reads `NMDC_ENV`, falling back to production when unset or blank.
    pub fn from_env() -> Result<Self, NmdcError> {
        match std::env::var(ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => Ok(ApiEnvironment::Prod),
        }
    }
}

impl fmt::Display for ApiEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiEnvironment::Prod => write!(f, "prod"),
            ApiEnvironment::Dev => write!(f, "dev"),
            ApiEnvironment::Backup => write!(f, "backup"),
        }
    }
}

impl FromStr for ApiEnvironment {
    type Err = NmdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "prod" => Ok(ApiEnvironment::Prod),
            "dev" => Ok(ApiEnvironment::Dev),
            "backup" => Ok(ApiEnvironment::Backup),
            _ => Err(NmdcError::InvalidEnvironment(value.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn for_env(env: ApiEnvironment) -> Self {
        Self::with_base_url(env.base_url())
    }

    /// Config for the data portal API of `env`, if it has one.
    pub fn data_for_env(env: ApiEnvironment) -> Option<Self> {
        env.data_base_url().map(Self::with_base_url)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_env(ApiEnvironment::Prod)
    }
}

/// Location of the link cache: `NMDC_LINK_CACHE` if set, else `~/.nmdc/links.db`.
pub fn default_cache_path() -> Result<Utf8PathBuf, NmdcError> {
    if let Ok(value) = std::env::var(CACHE_PATH_VAR) {
        if !value.trim().is_empty() {
            return Ok(Utf8PathBuf::from(value.trim()));
        }
    }
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".nmdc").join("links.db")).ok()
        })
        .ok_or_else(|| NmdcError::Filesystem("unable to resolve home directory".to_string()))
}
