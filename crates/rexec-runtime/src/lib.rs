//! Pooled remote command execution over SSH
//!
//! This crate runs shell commands on remote hosts and captures their output.
//! It includes:
//!
//! - A [`Transport`] seam with an SSH implementation built on `russh`
//! - [`Session`], one authenticated connection with an explicit lifecycle
//! - [`Invocation`], a command plus its timeout, stdin, environment and flags
//! - [`SessionPool`], which hands out one session per `user@host:port` and
//!   retries once when a connection dies underneath a command
//!
//! # Example
//!
//! ```no_run
//! use rexec_runtime::{Invocation, PoolConfig, SessionPool, Target};
//!
//! # async fn run() -> Result<(), rexec_runtime::ExecError> {
//! let pool = SessionPool::with_russh(&PoolConfig::default());
//! let target = Target::resolve("deploy@web-01:22");
//!
//! let result = pool.execute(&target, &Invocation::new("uptime")).await?;
//! println!("{}", result.stdout_text());
//!
//! pool.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod invocation;
pub mod pool;
pub mod session;
pub mod ssh_config;
pub mod ssh_env;
pub mod target;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    AuthMethod, BusyPolicy, ConfigError, ConnectOptions, HostEntry, HostKeyPolicy, PoolConfig,
};
pub use error::{ConnectFailure, ExecError, TransportError};
pub use invocation::{Invocation, InvocationResult, OutputLine};
pub use pool::{ConnectionInfo, SessionPool};
pub use session::{Session, SessionState};
pub use target::{AuthMaterial, SessionKey, Target};
pub use transport::{ChannelEvent, Connection, RusshTransport, Signal, Transport};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for logging to the terminal.
///
/// Output goes to stderr, filtered by `RUST_LOG` (default `info`).
///
/// ```ignore
/// // RUST_LOG=rexec_runtime=trace shows channel traffic
/// rexec_runtime::init_tracing();
/// ```
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
