use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, Result, WrapErr};
use rexec_runtime::{AuthMaterial, BusyPolicy, Invocation, PoolConfig, Target};
use tokio_util::sync::CancellationToken;

/// Run a command on one or more hosts over SSH
#[derive(Parser, Debug)]
#[command(name = "rexec-run", version)]
pub struct Args {
    /// Pool configuration file (.yaml, .yml or .json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to run on, as user@host:port or an ~/.ssh/config alias (repeatable)
    #[arg(short = 'H', long = "host")]
    pub hosts: Vec<String>,

    /// Username for every host, overriding the host string and ssh config
    #[arg(short, long)]
    pub user: Option<String>,

    /// Port for every host
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Read the password from this environment variable
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,

    /// Private key file to authenticate with
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// Command timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    pub timeout: u64,

    /// Connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Report non-zero exits without failing
    #[arg(short, long)]
    pub warn: bool,

    /// Print the command before running it
    #[arg(short, long)]
    pub echo: bool,

    /// Fail instead of waiting when a session is already running a command
    #[arg(long)]
    pub reject_busy: bool,

    /// The command to run, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Args {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    pub fn pool_config(&self) -> Result<PoolConfig> {
        let mut config = match &self.config {
            Some(path) => PoolConfig::load(path)
                .wrap_err_with(|| format!("loading {}", path.display()))?,
            None => PoolConfig::default(),
        };

        if self.reject_busy {
            config.busy_policy = BusyPolicy::Reject;
        }

        Ok(config)
    }

    /// Hosts from the config file followed by hosts from the command line,
    /// with command line overrides applied and duplicates removed
    pub fn targets(&self, config: &PoolConfig) -> Result<Vec<Target>> {
        let auth = self.auth_override()?;

        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();

        let from_config = config.hosts.iter().map(|entry| entry.to_target());
        let from_args = self.hosts.iter().map(|host| Target::resolve(host));

        for mut target in from_config.chain(from_args) {
            if let Some(user) = &self.user {
                target = target.with_user(user.clone());
            }
            if let Some(port) = self.port {
                target = target.with_port(port);
            }
            if let Some(auth) = &auth {
                target = target.with_auth(auth.clone());
            }
            if let Some(secs) = self.connect_timeout {
                target = target.with_connect_timeout(Duration::from_secs(secs));
            }

            if seen.insert(target.key()) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            bail!("no hosts given; use --host or list hosts in a config file");
        }

        Ok(targets)
    }

    fn auth_override(&self) -> Result<Option<AuthMaterial>> {
        if let Some(var) = &self.password_env {
            let password = std::env::var(var)
                .wrap_err_with(|| format!("reading password from ${var}"))?;
            if !password.is_empty() {
                return Ok(Some(AuthMaterial::Password { password }));
            }
            tracing::warn!("${var} is empty, not using it as a password");
        }

        Ok(self.identity.as_ref().map(|path| AuthMaterial::KeyFile {
            path: path.clone(),
            passphrase: None,
        }))
    }

    pub fn invocation(&self, cancel: CancellationToken) -> Invocation {
        Invocation::builder()
            .command(self.command_line())
            .timeout(Duration::from_secs(self.timeout))
            .warn(self.warn)
            .echo(self.echo)
            .cancel(cancel)
            .build()
    }
}
