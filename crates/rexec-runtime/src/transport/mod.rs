//! The transport capability: authenticated byte-stream channels to a host.
//!
//! The session layer only talks to these traits. [`RusshTransport`] is the
//! SSH implementation; tests substitute a scripted one.

mod ssh;

#[cfg(test)]
mod integration_tests;

pub use self::ssh::RusshTransport;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ConnectOptions;
use crate::error::TransportError;
use crate::target::Target;

/// Something coming back from a running remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

/// Signals that can be delivered to a remote process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

/// Opens authenticated connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate. The caller enforces the connect timeout.
    async fn open(
        &self,
        target: &Target,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One authenticated connection, running at most one command at a time
#[async_trait]
pub trait Connection: Send {
    /// Start `command` on a fresh channel, replacing any previous one
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Write to the running command's stdin
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn send_eof(&mut self) -> Result<(), TransportError>;

    /// Next event from the running command; `None` once it has exited and
    /// all of its output has been delivered
    async fn recv(&mut self) -> Result<Option<ChannelEvent>, TransportError>;

    async fn signal(&mut self, signal: Signal) -> Result<(), TransportError>;

    /// Drop the current command channel without waiting for it
    async fn close_channel(&mut self);

    /// Probe whether the connection still answers
    async fn keepalive(&mut self) -> bool;

    async fn close(&mut self) -> Result<(), TransportError>;
}
