use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh_config;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of a session slot in the pool. Two targets with the same key share
/// one session, regardless of the auth material they carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Credentials handed to the transport. The session layer never looks inside.
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMaterial {
    /// Rely on the agent and default key files
    #[default]
    None,
    Password {
        password: String,
    },
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::None => write!(f, "None"),
            AuthMaterial::Password { .. } => write!(f, "Password(***)"),
            AuthMaterial::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// A remote endpoint plus the credentials used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
    user: String,
    auth: AuthMaterial,
    connect_timeout: Duration,
}

impl Target {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            auth: AuthMaterial::None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Build a target from `user@host:port`, filling the gaps from
    /// `~/.ssh/config` and finally from the local username and port 22.
    pub fn resolve(host: &str) -> Self {
        let resolved = ssh_config::resolve(host);
        Self {
            host: resolved.hostname,
            port: resolved.port,
            user: resolved.username.unwrap_or_else(whoami::username),
            auth: resolved
                .identity_files
                .into_iter()
                .next()
                .map(|path| AuthMaterial::KeyFile {
                    path,
                    passphrase: None,
                })
                .unwrap_or_default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, auth: AuthMaterial) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_password(self, password: impl Into<String>) -> Self {
        let password = password.into();
        // An empty password means "no password", not "authenticate with ''"
        if password.is_empty() {
            return self;
        }
        self.with_auth(AuthMaterial::Password { password })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn auth(&self) -> &AuthMaterial {
        &self.auth
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }
}
