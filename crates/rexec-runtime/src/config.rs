//! Connection and pool configuration.
//!
//! Everything here has a default, so an empty YAML/JSON document is a valid
//! configuration. Durations are expressed in whole seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::target::{AuthMaterial, Target};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

/// Which authentication mechanism the transport should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Agent, then default key files, then whatever auth material the target carries
    #[default]
    Auto,
    /// Only the target's password
    Password,
    /// Only the target's key file
    PublicKey,
    /// Only the SSH agent
    Agent,
}

/// What to do with the server's host key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept every host key without looking at known_hosts
    AcceptAny,
    /// Accept unknown hosts, reject hosts whose key changed
    #[default]
    AcceptNew,
    /// Only accept hosts already present in known_hosts
    Strict,
}

/// What a caller gets when the session it needs is already running a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Wait until the session is free (or the invocation is cancelled)
    #[default]
    Block,
    /// Fail immediately with `SessionBusy`
    Reject,
}

/// Options passed to the transport when a session connects
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub auth_method: AuthMethod,
    pub host_key_policy: HostKeyPolicy,
    /// Negotiate zlib compression
    pub compression: bool,
    /// Interval between transport-level keepalives, disabled when unset
    #[serde(with = "secs_opt")]
    pub keepalive_interval: Option<Duration>,
    /// Defaults to `~/.ssh/known_hosts`
    pub known_hosts_file: Option<PathBuf>,
}

/// A host listed in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// `user@host:port`, or an alias from `~/.ssh/config`
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, skip_serializing)]
    pub auth: AuthMaterial,
    #[serde(default, with = "secs_opt")]
    pub connect_timeout: Option<Duration>,
}

impl HostEntry {
    pub fn to_target(&self) -> Target {
        let mut target = Target::resolve(&self.host);
        if let Some(user) = &self.user {
            target = target.with_user(user.clone());
        }
        if let Some(port) = self.port {
            target = target.with_port(port);
        }
        if self.auth != AuthMaterial::None {
            target = target.with_auth(self.auth.clone());
        }
        if let Some(timeout) = self.connect_timeout {
            target = target.with_connect_timeout(timeout);
        }
        target
    }
}

/// Top level configuration for a [`SessionPool`](crate::pool::SessionPool)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub busy_policy: BusyPolicy,
    pub connect: ConnectOptions,
    pub hosts: Vec<HostEntry>,
}

impl PoolConfig {
    /// Load a config file, picking the format from the extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            Some("json") => Ok(serde_json::from_str(&content)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

mod secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
