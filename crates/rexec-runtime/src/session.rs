// One logical, authenticated connection to a single host.
// Owns the transport handle, tracks liveness, and runs one command at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{BusyPolicy, ConnectOptions};
use crate::error::{ConnectFailure, ExecError, TransportError};
use crate::invocation::{Invocation, InvocationResult, OutputCollector};
use crate::target::{SessionKey, Target};
use crate::transport::{ChannelEvent, Connection, Signal, Transport};

/// Lifecycle of a session
///
/// ```text
/// Unconnected ──connect──▶ Connecting ──ok──▶ Ready
///                              │                │
///                              └──err──▶ Failed ◀┘ (connection lost)
///            (any state) ──close──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
    Closed,
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    last_failure: Option<ConnectFailure>,
}

type ConnectionSlot = Option<Box<dyn Connection>>;

/// Why the command loop stopped
enum Stop {
    Finished,
    Failed(TransportError),
    TimedOut,
    Cancelled,
    Closed,
}

pub struct Session {
    target: Target,
    key: SessionKey,
    options: Arc<ConnectOptions>,
    busy_policy: BusyPolicy,
    transport: Arc<dyn Transport>,

    /// Held for the whole of a connect or a command run
    connection: Mutex<ConnectionSlot>,
    status: StdMutex<Status>,
    closed: CancellationToken,
    /// Set while a liveness check holds `connection`
    checking: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        target: Target,
        options: Arc<ConnectOptions>,
        busy_policy: BusyPolicy,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            key: target.key(),
            target,
            options,
            busy_policy,
            transport,
            connection: Mutex::new(None),
            status: StdMutex::new(Status {
                state: SessionState::Unconnected,
                last_failure: None,
            }),
            closed: CancellationToken::new(),
            checking: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Cause of the most recent failed connect, cleared once connected
    pub fn last_failure(&self) -> Option<ConnectFailure> {
        self.status().last_failure
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `state` unless the session has been closed in the meantime
    fn transition(&self, state: SessionState, failure: Option<ConnectFailure>) -> bool {
        let mut status = self.status();
        if status.state == SessionState::Closed {
            return false;
        }
        tracing::trace!("Session {} {:?} -> {:?}", self.key, status.state, state);
        status.state = state;
        status.last_failure = failure;
        true
    }

    /// Establish the transport and authenticate.
    ///
    /// No-op when already Ready. A closed session can never connect again.
    pub async fn connect(&self) -> Result<(), ExecError> {
        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Closed => return Err(ExecError::SessionClosed(self.key.clone())),
            _ => {}
        }

        let mut slot = tokio::select! {
            slot = self.connection.lock() => slot,
            _ = self.closed.cancelled() => return Err(ExecError::SessionClosed(self.key.clone())),
        };

        // Someone else may have connected while we waited for the lock
        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Closed => return Err(ExecError::SessionClosed(self.key.clone())),
            _ => {}
        }

        self.transition(SessionState::Connecting, None);
        let _connecting = Connecting(self);
        tracing::debug!("Creating new SSH connection for {}", self.key);

        let connect_timeout = self.target.connect_timeout();
        let opened = tokio::select! {
            _ = self.closed.cancelled() => Err(ExecError::SessionClosed(self.key.clone())),
            result = timeout(connect_timeout, self.transport.open(&self.target, &self.options)) => {
                match result {
                    Ok(Ok(connection)) => Ok(connection),
                    Ok(Err(e)) => Err(ExecError::from_transport(&self.key, e)),
                    Err(_) => Err(ExecError::ConnectTimeout {
                        key: self.key.clone(),
                        timeout: connect_timeout,
                    }),
                }
            }
        };

        let mut connection = match opened {
            Ok(connection) => connection,
            Err(e) => {
                let failure = match &e {
                    ExecError::Auth { .. } => ConnectFailure::Auth,
                    ExecError::ConnectTimeout { .. } => ConnectFailure::Timeout,
                    _ => ConnectFailure::Network,
                };
                tracing::warn!("Failed to connect to {}: {e}", self.key);
                self.transition(SessionState::Failed, Some(failure));
                return Err(e);
            }
        };

        if !self.transition(SessionState::Ready, None) {
            // Closed while the handshake was in flight
            let _ = connection.close().await;
            return Err(ExecError::SessionClosed(self.key.clone()));
        }

        *slot = Some(connection);
        tracing::debug!("Session {} is ready", self.key);
        Ok(())
    }

    /// Wait for (or reject, per the busy policy) exclusive use of the connection
    async fn lock_connection(
        &self,
        invocation: &Invocation,
    ) -> Result<MutexGuard<'_, ConnectionSlot>, ExecError> {
        if self.busy_policy == BusyPolicy::Reject {
            match self.connection.try_lock() {
                Ok(guard) => return Ok(guard),
                // A liveness check is not a command; wait it out
                Err(_) if self.checking.load(Ordering::SeqCst) => {}
                Err(_) => return Err(ExecError::SessionBusy(self.key.clone())),
            }
        }

        tokio::select! {
            guard = self.connection.lock() => Ok(guard),
            _ = wait_cancelled(invocation.cancel.as_ref()) => Err(ExecError::Cancelled {
                partial: Box::new(InvocationResult::empty(&invocation.command)),
            }),
            _ = self.closed.cancelled() => Err(ExecError::SessionClosed(self.key.clone())),
        }
    }

    /// Run one command. Requires the session to be Ready.
    pub async fn run(&self, invocation: &Invocation) -> Result<InvocationResult, ExecError> {
        invocation.validate()?;

        if invocation.is_cancelled() {
            return Err(ExecError::Cancelled {
                partial: Box::new(InvocationResult::empty(&invocation.command)),
            });
        }

        let mut slot = self.lock_connection(invocation).await?;

        match self.state() {
            SessionState::Ready => {}
            SessionState::Closed => return Err(ExecError::SessionClosed(self.key.clone())),
            _ => return Err(ExecError::NotConnected(self.key.clone())),
        }
        let Some(connection) = slot.as_mut() else {
            return Err(ExecError::NotConnected(self.key.clone()));
        };

        let command_line = invocation.command_line();
        let started = Instant::now();
        let mut output = OutputCollector::new(invocation.output.clone());
        if invocation.echo {
            output.echo(&invocation.command).await;
        }
        let mut exit_code = None;

        let stop = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Stop::Closed,
            _ = wait_cancelled(invocation.cancel.as_ref()) => Stop::Cancelled,
            _ = tokio::time::sleep(invocation.timeout) => Stop::TimedOut,
            result = pump(
                &mut **connection,
                &command_line,
                invocation,
                &mut output,
                &mut exit_code,
            ) => match result {
                Ok(()) => Stop::Finished,
                Err(e) => Stop::Failed(e),
            },
        };

        let elapsed = started.elapsed();
        let exit_code = match (&stop, exit_code) {
            (_, Some(code)) => code,
            (Stop::Finished, None) => {
                tracing::warn!(
                    "Command on {} finished without an exit status",
                    self.key
                );
                -1
            }
            _ => -1,
        };

        match stop {
            Stop::Finished => {}
            Stop::Failed(e) => {
                tracing::warn!("Command on {} failed: {e}", self.key);
                if matches!(e, TransportError::Closed | TransportError::Network(_)) {
                    // The connection is gone; drop it so nobody reuses it
                    if let Some(mut dead) = slot.take() {
                        let _ = dead.close().await;
                    }
                    self.transition(SessionState::Failed, Some(ConnectFailure::Network));
                }
                return Err(ExecError::from_transport(&self.key, e));
            }
            Stop::TimedOut => {
                tracing::debug!(
                    "Command on {} timed out after {:?}",
                    self.key,
                    invocation.timeout
                );
                interrupt(&mut **connection, Signal::Kill).await;
                let partial = output
                    .finish(&invocation.command, exit_code, elapsed)
                    .await;
                return Err(ExecError::InvocationTimeout {
                    timeout: invocation.timeout,
                    partial: Box::new(partial),
                });
            }
            Stop::Cancelled => {
                tracing::debug!("Command on {} cancelled", self.key);
                interrupt(&mut **connection, Signal::Interrupt).await;
                let partial = output
                    .finish(&invocation.command, exit_code, elapsed)
                    .await;
                return Err(ExecError::Cancelled {
                    partial: Box::new(partial),
                });
            }
            Stop::Closed => {
                interrupt(&mut **connection, Signal::Kill).await;
                return Err(ExecError::SessionClosed(self.key.clone()));
            }
        }

        drop(slot);

        let result = output
            .finish(&invocation.command, exit_code, elapsed)
            .await;
        tracing::debug!(
            "Command on {} exited with {} after {:?}",
            self.key,
            result.exit_code,
            result.elapsed
        );

        if result.exit_code != 0 && !invocation.warn {
            return Err(ExecError::NonZeroExit(Box::new(result)));
        }

        Ok(result)
    }

    /// Send a keepalive over the connection. A session running a command
    /// counts as alive without being touched.
    ///
    /// The connection is held for the duration of the keepalive. Commands
    /// arriving meanwhile wait for it even under [`BusyPolicy::Reject`].
    pub async fn is_alive(&self) -> bool {
        if self.state() != SessionState::Ready {
            return false;
        }

        let Ok(slot) = self.connection.try_lock() else {
            return true;
        };
        let mut check = Checking::new(slot, &self.checking);

        match check.slot.as_mut().and_then(|slot| slot.as_mut()) {
            Some(connection) => connection.keepalive().await,
            None => false,
        }
    }

    /// Release the transport handle. Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut status = self.status();
            if status.state != SessionState::Closed {
                tracing::debug!("Closing session {}", self.key);
            }
            status.state = SessionState::Closed;
        }

        // Wakes a running command or a pending connect, so the lock frees up
        self.closed.cancel();

        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            if let Err(e) = connection.close().await {
                tracing::debug!("Error while disconnecting {}: {e}", self.key);
            }
        }
    }
}

/// Puts a connect that was abandoned mid-flight back to Unconnected
struct Connecting<'a>(&'a Session);

impl Drop for Connecting<'_> {
    fn drop(&mut self) {
        let mut status = self.0.status();
        if status.state == SessionState::Connecting {
            status.state = SessionState::Unconnected;
        }
    }
}

/// Holds the connection for a keepalive and flags it as such
struct Checking<'a> {
    slot: Option<MutexGuard<'a, ConnectionSlot>>,
    flag: &'a AtomicBool,
}

impl<'a> Checking<'a> {
    fn new(slot: MutexGuard<'a, ConnectionSlot>, flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self {
            slot: Some(slot),
            flag,
        }
    }
}

impl Drop for Checking<'_> {
    fn drop(&mut self) {
        // Release the connection before clearing the flag so a waiter never
        // sees it held and unflagged
        self.slot.take();
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Start the command, feed stdin, and collect events until it exits
async fn pump(
    connection: &mut dyn Connection,
    command_line: &str,
    invocation: &Invocation,
    output: &mut OutputCollector,
    exit_code: &mut Option<i32>,
) -> Result<(), TransportError> {
    connection.exec(command_line).await?;

    if let Some(stdin) = &invocation.stdin {
        connection.send(stdin).await?;
    }
    connection.send_eof().await?;

    while let Some(event) = connection.recv().await? {
        match event {
            ChannelEvent::Stdout(data) => output.push_stdout(&data).await,
            ChannelEvent::Stderr(data) => output.push_stderr(&data).await,
            ChannelEvent::Exit(code) => *exit_code = Some(code),
        }
    }

    Ok(())
}

/// Best-effort signal to the remote process, then abandon its channel
async fn interrupt(connection: &mut dyn Connection, signal: Signal) {
    if let Err(e) = connection.signal(signal).await {
        tracing::debug!("Could not deliver {signal:?} to remote process: {e}");
    }
    connection.close_channel().await;
}

pub(crate) async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
