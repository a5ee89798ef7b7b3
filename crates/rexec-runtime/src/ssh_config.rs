//! Resolution of `user@host:port` strings against `~/.ssh/config`.

use std::path::{Path, PathBuf};

/// Connection settings resolved for a host string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub identity_files: Vec<PathBuf>,
}

/// Parse user@hostname:port format and extract components
pub fn parse_host_string(input: &str) -> (Option<String>, String, Option<u16>) {
    // Handle user@host:port, user@host, host:port, or just host
    let (user_part, host_part) = if let Some(at_pos) = input.rfind('@') {
        let user = input[..at_pos].to_string();
        (Some(user), &input[at_pos + 1..])
    } else {
        (None, input)
    };

    let (hostname, port) = if let Some(colon_pos) = host_part.rfind(':') {
        let host = &host_part[..colon_pos];
        let port_str = &host_part[colon_pos + 1..];

        // A bare IPv6 address has colons but no port
        let bare_ipv6 = host.contains(':') && !host.ends_with(']');

        match port_str.parse::<u16>() {
            Ok(port) if !bare_ipv6 => (host.to_string(), Some(port)),
            _ => (host_part.to_string(), None),
        }
    } else {
        (host_part.to_string(), None)
    };

    let hostname = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .map(str::to_string)
        .unwrap_or(hostname);

    (user_part, hostname, port)
}

/// Resolve a host string using `~/.ssh/config`
pub fn resolve(host: &str) -> ResolvedHost {
    let config_path = dirs::home_dir().map(|home| home.join(".ssh").join("config"));
    resolve_with_config(host, config_path.as_deref())
}

/// Resolve a host string against an explicit ssh config file.
///
/// Values given in the host string win over the config file, which wins over
/// the defaults (port 22, no username).
pub fn resolve_with_config(host: &str, config_path: Option<&Path>) -> ResolvedHost {
    let (input_user, hostname, input_port) = parse_host_string(host);

    let default_config = ResolvedHost {
        hostname: hostname.clone(),
        port: input_port.unwrap_or(crate::target::DEFAULT_PORT),
        username: input_user.clone(),
        identity_files: vec![],
    };

    let Some(path) = config_path.filter(|p| p.exists()) else {
        tracing::debug!("No SSH config found for {host}, using defaults");
        return default_config;
    };

    match russh_config::parse_path(path, &hostname) {
        Ok(config) => {
            let resolved_hostname = if config.host_name.is_empty() {
                hostname.clone()
            } else {
                config.host_name
            };
            let port = input_port.unwrap_or(config.port);
            let username = input_user.or(if config.user.is_empty() {
                None
            } else {
                Some(config.user)
            });

            let identity_files = config
                .identity_file
                .map(|file| expand_identity_file(&file))
                .into_iter()
                .filter(|path| path.exists())
                .collect::<Vec<_>>();

            tracing::debug!(
                "Resolved SSH config for {host}: hostname={resolved_hostname}, port={port}, username={username:?}, identity_files={identity_files:?}"
            );

            ResolvedHost {
                hostname: resolved_hostname,
                port,
                username,
                identity_files,
            }
        }
        Err(e) => {
            tracing::warn!("Failed to parse SSH config {}: {e}", path.display());
            default_config
        }
    }
}

fn expand_identity_file(file: &str) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(file);
    };

    if let Some(rest) = file.strip_prefix("~/") {
        home.join(rest)
    } else if file.starts_with('/') {
        PathBuf::from(file)
    } else {
        home.join(".ssh").join(file)
    }
}
