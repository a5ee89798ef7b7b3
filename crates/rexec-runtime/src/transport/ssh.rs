// SSH implementation of the transport capability, on top of russh.
// Connect, verify the host key, authenticate, and run one command channel at a time.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use tokio::time::timeout;

use super::{ChannelEvent, Connection, Signal, Transport};
use crate::config::{AuthMethod, ConnectOptions, HostKeyPolicy};
use crate::error::TransportError;
use crate::target::{AuthMaterial, Target};

const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens russh connections
#[derive(Debug, Clone, Copy, Default)]
pub struct RusshTransport;

#[async_trait]
impl Transport for RusshTransport {
    async fn open(
        &self,
        target: &Target,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let config = client_config(options);
        let handler = ClientHandler {
            host: target.host().to_string(),
            port: target.port(),
            policy: options.host_key_policy,
            known_hosts: options
                .known_hosts_file
                .clone()
                .or_else(default_known_hosts),
        };

        tracing::debug!("Connecting to {}:{}", target.host(), target.port());
        let handle = russh::client::connect(
            Arc::new(config),
            (target.host(), target.port()),
            handler,
        )
        .await
        .map_err(classify)?;

        let mut connection = RusshConnection {
            handle,
            channel: None,
            got_eof: false,
            got_exit: false,
        };
        connection.authenticate(target, options.auth_method).await?;

        Ok(Box::new(connection))
    }
}

fn client_config(options: &ConnectOptions) -> russh::client::Config {
    let compression: &'static [russh::compression::Name] = if options.compression {
        &[
            russh::compression::ZLIB,
            russh::compression::ZLIB_LEGACY,
            russh::compression::NONE,
        ]
    } else {
        &[russh::compression::NONE]
    };

    russh::client::Config {
        keepalive_interval: options.keepalive_interval,
        preferred: russh::Preferred {
            compression: Cow::Borrowed(compression),
            ..russh::Preferred::default()
        },
        ..Default::default()
    }
}

fn default_known_hosts() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

fn classify(err: russh::Error) -> TransportError {
    match err {
        russh::Error::UnknownKey => TransportError::Auth("host key verification failed".into()),
        russh::Error::Disconnect => TransportError::Closed,
        other => TransportError::Network(other.to_string()),
    }
}

/// Exit code a shell would report for a process killed by `signal`
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => return -1,
    };
    128 + number
}

/// Host key verification for russh
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl ClientHandler {
    /// Ok(true) if known and matching, Ok(false) if unknown, Err if the key changed
    fn lookup(&self, key: &russh::keys::PublicKey) -> Result<bool, String> {
        let Some(path) = self.known_hosts.as_deref().filter(|p| p.exists()) else {
            return Ok(false);
        };

        russh::keys::check_known_hosts_path(&self.host, self.port, key, path)
            .map_err(|e| e.to_string())
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = match (self.policy, self.lookup(server_public_key)) {
            (HostKeyPolicy::AcceptAny, _) => true,
            (_, Ok(true)) => true,
            (HostKeyPolicy::AcceptNew, Ok(false)) => {
                tracing::info!("Accepting unknown host key for {}:{}", self.host, self.port);
                true
            }
            (HostKeyPolicy::Strict, Ok(false)) => {
                tracing::warn!(
                    "Host {}:{} is not in known_hosts, rejecting",
                    self.host,
                    self.port
                );
                false
            }
            (_, Err(e)) => {
                tracing::warn!(
                    "Host key verification failed for {}:{}: {e}",
                    self.host,
                    self.port
                );
                false
            }
        };
        Ok(accepted)
    }
}

/// An authenticated russh connection
struct RusshConnection {
    handle: Handle<ClientHandler>,
    channel: Option<Channel<Msg>>,
    got_eof: bool,
    got_exit: bool,
}

impl RusshConnection {
    async fn authenticate(
        &mut self,
        target: &Target,
        method: AuthMethod,
    ) -> Result<(), TransportError> {
        let username = target.user();
        tracing::info!(
            "Starting SSH authentication for {username}@{} ({method:?})",
            target.host()
        );

        let authenticated = match method {
            AuthMethod::Agent => self.agent_auth(username).await,
            AuthMethod::Password => match target.auth() {
                AuthMaterial::Password { password } => {
                    self.password_auth(username, password).await?
                }
                _ => return Err(TransportError::Auth("no password supplied".into())),
            },
            AuthMethod::PublicKey => match target.auth() {
                AuthMaterial::KeyFile { path, passphrase } => {
                    self.key_auth(username, path, passphrase.as_deref()).await?
                }
                _ => self.default_keys_auth(username).await,
            },
            AuthMethod::Auto => self.auto_auth(username, target.auth()).await?,
        };

        if authenticated {
            tracing::info!("SSH authentication successful for {username}@{}", target.host());
            Ok(())
        } else {
            Err(TransportError::Auth(format!(
                "all {method:?} authentication attempts were rejected for {username}"
            )))
        }
    }

    /// Agent, then default keys, then whatever the target carries
    async fn auto_auth(
        &mut self,
        username: &str,
        auth: &AuthMaterial,
    ) -> Result<bool, TransportError> {
        tracing::debug!("Step 1/3: Trying SSH agent authentication");
        if self.agent_auth(username).await {
            return Ok(true);
        }

        tracing::debug!("Step 2/3: Trying default SSH keys");
        if self.default_keys_auth(username).await {
            return Ok(true);
        }

        tracing::debug!("Step 3/3: Trying explicitly provided authentication");
        match auth {
            AuthMaterial::Password { password } => self.password_auth(username, password).await,
            AuthMaterial::KeyFile { path, passphrase } => {
                self.key_auth(username, path, passphrase.as_deref()).await
            }
            AuthMaterial::None => {
                tracing::warn!("All SSH authentication methods exhausted");
                Ok(false)
            }
        }
    }

    async fn password_auth(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, TransportError> {
        let auth_res = self
            .handle
            .authenticate_password(username, password)
            .await
            .map_err(classify)?;

        Ok(matches!(auth_res, russh::client::AuthResult::Success))
    }

    async fn key_auth(
        &mut self,
        username: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<bool, TransportError> {
        tracing::debug!(
            "Attempting public key authentication with {}",
            key_path.display()
        );

        let key_pair = russh::keys::load_secret_key(key_path, passphrase).map_err(|e| {
            TransportError::Auth(format!("failed to load key {}: {e}", key_path.display()))
        })?;

        // Ask the server for its preferred RSA hash so legacy servers keep working
        let best_hash = self
            .handle
            .best_supported_rsa_hash()
            .await
            .map_err(classify)?
            .flatten();
        let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), best_hash);

        let auth_res = self
            .handle
            .authenticate_publickey(username, key_with_alg)
            .await
            .map_err(classify)?;

        match auth_res {
            russh::client::AuthResult::Success => Ok(true),
            russh::client::AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                tracing::debug!(
                    "Server rejected key {} (remaining methods: {:?}, partial: {})",
                    key_path.display(),
                    remaining_methods,
                    partial_success
                );
                Ok(false)
            }
        }
    }

    async fn default_keys_auth(&mut self, username: &str) -> bool {
        for key_path in default_ssh_keys() {
            match self.key_auth(username, &key_path, None).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tracing::debug!("Default SSH key failed: {e}"),
            }
        }
        false
    }

    async fn agent_auth(&mut self, username: &str) -> bool {
        let mut agent = match russh::keys::agent::client::AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::debug!("Cannot connect to SSH agent: {e}");
                return false;
            }
        };

        let keys = match agent.request_identities().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!("Failed to request identities from SSH agent: {e}");
                return false;
            }
        };

        tracing::debug!("SSH agent has {} keys available", keys.len());
        for (i, key) in keys.iter().enumerate() {
            match self
                .handle
                .authenticate_publickey_with(username, key.clone(), None, &mut agent)
                .await
            {
                Ok(russh::client::AuthResult::Success) => return true,
                Ok(_) => tracing::debug!("SSH agent key #{} rejected by server", i + 1),
                Err(e) => tracing::debug!("Error trying SSH agent key #{}: {e:?}", i + 1),
            }
        }
        false
    }

    fn channel(&mut self) -> Result<&mut Channel<Msg>, TransportError> {
        self.channel.as_mut().ok_or(TransportError::Closed)
    }
}

/// Default private keys, in the order the ssh command tries them
fn default_ssh_keys() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return vec![];
    };

    let ssh_dir = home.join(".ssh");
    ["id_rsa", "id_ecdsa", "id_ecdsa_sk", "id_ed25519", "id_ed25519_sk"]
        .into_iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

#[async_trait]
impl Connection for RusshConnection {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.close_channel().await;

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(classify)?;

        tracing::debug!("Executing command on remote: {command}");
        channel.exec(true, command).await.map_err(classify)?;

        self.channel = Some(channel);
        self.got_eof = false;
        self.got_exit = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel()?.data(data).await.map_err(classify)
    }

    async fn send_eof(&mut self) -> Result<(), TransportError> {
        self.channel()?.eof().await.map_err(classify)
    }

    async fn recv(&mut self) -> Result<Option<ChannelEvent>, TransportError> {
        loop {
            // ExitStatus does not guarantee all Data has been delivered (RFC 4254
            // §6.10); only Eof does. The command is finished once both arrived.
            if self.got_eof && self.got_exit {
                self.close_channel().await;
                return Ok(None);
            }

            let Some(channel) = self.channel.as_mut() else {
                return Ok(None);
            };

            let Some(msg) = channel.wait().await else {
                self.channel = None;
                return if self.got_exit {
                    Ok(None)
                } else {
                    Err(TransportError::Closed)
                };
            };

            match msg {
                ChannelMsg::Data { data } => {
                    tracing::trace!("SSH Data message ({} bytes)", data.len());
                    return Ok(Some(ChannelEvent::Stdout(Bytes::copy_from_slice(&data))));
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    tracing::trace!("SSH ExtendedData message ({} bytes)", data.len());
                    return Ok(Some(ChannelEvent::Stderr(Bytes::copy_from_slice(&data))));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    self.got_exit = true;
                    return Ok(Some(ChannelEvent::Exit(exit_status as i32)));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    tracing::debug!("Remote process killed by signal {signal_name:?}");
                    self.got_exit = true;
                    return Ok(Some(ChannelEvent::Exit(signal_exit_code(&signal_name))));
                }
                ChannelMsg::Eof => {
                    tracing::trace!("SSH EOF message");
                    self.got_eof = true;
                }
                ChannelMsg::Close => {
                    tracing::trace!("SSH Close message");
                    self.channel = None;
                    return if self.got_exit {
                        Ok(None)
                    } else {
                        Err(TransportError::Closed)
                    };
                }
                _ => {}
            }
        }
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), TransportError> {
        let sig = match signal {
            Signal::Interrupt => Sig::INT,
            Signal::Terminate => Sig::TERM,
            Signal::Kill => Sig::KILL,
        };
        self.channel()?.signal(sig).await.map_err(classify)
    }

    async fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
    }

    async fn keepalive(&mut self) -> bool {
        if self.handle.is_closed() {
            return false;
        }

        let keepalive_check = async {
            let mut channel = self.handle.channel_open_session().await.ok()?;
            channel.exec(true, "true").await.ok()?;

            let mut code = None;
            while let Some(msg) = channel.wait().await {
                if let ChannelMsg::ExitStatus { exit_status } = msg {
                    code = Some(exit_status);
                }
            }

            let _ = channel.close().await;
            code
        };

        match timeout(KEEPALIVE_TIMEOUT, keepalive_check).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => {
                tracing::debug!("SSH keepalive timed out");
                false
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.close_channel().await;
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(classify)
    }
}
