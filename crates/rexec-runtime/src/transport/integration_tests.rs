//! SSH integration tests
//!
//! These need a reachable SSH server. They are `#[ignore]`d by default and
//! must be run explicitly:
//!
//! ```bash
//! SSH_TEST_HOST=localhost SSH_TEST_PORT=2222 SSH_TEST_USER=testuser \
//!     cargo test -p rexec-runtime -- --ignored --test-threads=1
//! ```
//!
//! Environment variables:
//! - SSH_TEST_HOST: target host (default: localhost)
//! - SSH_TEST_PORT: target port (default: 2222)
//! - SSH_TEST_USER: username (default: testuser)
//! - SSH_TEST_PASSWORD: password (default: testpassword)
//! - SSH_TEST_KEYS_DIR: directory holding `id_ed25519` (default: ~/.ssh)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AuthMethod, ConnectOptions, HostKeyPolicy, PoolConfig};
use crate::error::ExecError;
use crate::invocation::Invocation;
use crate::pool::SessionPool;
use crate::target::{AuthMaterial, Target};

use super::{ChannelEvent, Connection, RusshTransport, Transport};

fn test_host() -> String {
    std::env::var("SSH_TEST_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn test_port() -> u16 {
    std::env::var("SSH_TEST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2222)
}

fn test_user() -> String {
    std::env::var("SSH_TEST_USER").unwrap_or_else(|_| "testuser".to_string())
}

fn test_password() -> String {
    std::env::var("SSH_TEST_PASSWORD").unwrap_or_else(|_| "testpassword".to_string())
}

fn test_keys_dir() -> PathBuf {
    std::env::var("SSH_TEST_KEYS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs::home_dir().unwrap().join(".ssh"))
}

fn password_target() -> Target {
    Target::new(test_host(), test_user())
        .with_port(test_port())
        .with_password(test_password())
        .with_connect_timeout(Duration::from_secs(10))
}

fn key_target() -> Target {
    Target::new(test_host(), test_user())
        .with_port(test_port())
        .with_auth(AuthMaterial::KeyFile {
            path: test_keys_dir().join("id_ed25519"),
            passphrase: None,
        })
}

fn options(auth_method: AuthMethod) -> PoolConfig {
    PoolConfig {
        connect: ConnectOptions {
            auth_method,
            host_key_policy: HostKeyPolicy::AcceptAny,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn password_pool() -> SessionPool {
    SessionPool::with_russh(&options(AuthMethod::Password))
}

// Transport

#[tokio::test]
#[ignore]
async fn test_transport_password_auth() {
    let result = RusshTransport
        .open(&password_target(), &options(AuthMethod::Password).connect)
        .await;
    assert!(result.is_ok(), "password auth failed: {:?}", result.err());
}

#[tokio::test]
#[ignore]
async fn test_transport_key_auth() {
    let result = RusshTransport
        .open(&key_target(), &options(AuthMethod::PublicKey).connect)
        .await;
    assert!(result.is_ok(), "key auth failed: {:?}", result.err());
}

#[tokio::test]
#[ignore]
async fn test_transport_wrong_password() {
    let target = password_target().with_password("definitely-wrong");
    let result = RusshTransport
        .open(&target, &options(AuthMethod::Password).connect)
        .await;
    assert!(matches!(result, Err(crate::error::TransportError::Auth(_))));
}

#[tokio::test]
#[ignore]
async fn test_transport_raw_events() {
    let mut connection = RusshTransport
        .open(&password_target(), &options(AuthMethod::Password).connect)
        .await
        .unwrap();

    connection.exec("echo out; echo err >&2; exit 3").await.unwrap();
    connection.send_eof().await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = connection.recv().await.unwrap() {
        events.push(event);
    }

    assert!(events.contains(&ChannelEvent::Exit(3)));
    assert!(events
        .iter()
        .any(|e| matches!(e, ChannelEvent::Stderr(data) if &data[..] == b"err\n")));
    assert!(connection.keepalive().await);
    connection.close().await.unwrap();
}

// Pool

#[tokio::test]
#[ignore]
async fn test_pool_echo_hello() {
    let pool = password_pool();

    let result = pool
        .execute(&password_target(), &Invocation::new("echo hello"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout_text(), "hello\n");
    assert_eq!(result.stderr_text(), "");

    pool.close_all().await;
}

#[tokio::test]
#[ignore]
async fn test_pool_false_with_warn() {
    let pool = password_pool();
    let target = password_target();

    let err = pool
        .execute(&target, &Invocation::new("false"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::NonZeroExit(_)));

    let invocation = Invocation::builder().command("false").warn(true).build();
    let result = pool.execute(&target, &invocation).await.unwrap();
    assert_eq!(result.exit_code, 1);

    pool.close_all().await;
}

#[tokio::test]
#[ignore]
async fn test_pool_timeout_keeps_partial_output() {
    let pool = password_pool();
    let target = password_target();

    let invocation = Invocation::builder()
        .command("echo started; sleep 5")
        .timeout(Duration::from_secs(1))
        .build();
    let err = pool.execute(&target, &invocation).await.unwrap_err();

    assert!(matches!(err, ExecError::InvocationTimeout { .. }));
    assert_eq!(err.partial_result().unwrap().stdout_text(), "started\n");

    // The connection is still usable afterwards
    let result = pool
        .execute(&target, &Invocation::new("echo still here"))
        .await
        .unwrap();
    assert_eq!(result.stdout_text(), "still here\n");

    pool.close_all().await;
}

#[tokio::test]
#[ignore]
async fn test_pool_env_and_stdin() {
    let pool = password_pool();
    let target = password_target();

    let mut env = std::collections::BTreeMap::new();
    env.insert("GREETING".to_string(), "it's alive".to_string());
    let invocation = Invocation::builder()
        .command("printf '%s' \"$GREETING\"; cat")
        .env(env)
        .stdin(&b" via stdin"[..])
        .build();

    let result = pool.execute(&target, &invocation).await.unwrap();
    assert_eq!(result.stdout_text(), "it's alive via stdin");

    pool.close_all().await;
}

#[tokio::test]
#[ignore]
async fn test_pool_parallel_hosts() {
    let pool = password_pool();
    let target = password_target();
    let other = Target::new(test_host(), test_user())
        .with_port(test_port())
        .with_password(test_password());

    let hostname = Invocation::new("hostname");
    let (a, b) = tokio::join!(
        pool.execute(&target, &hostname),
        pool.execute(&other, &hostname),
    );
    assert_eq!(a.unwrap().stdout, b.unwrap().stdout);
    assert_eq!(pool.len(), 1);

    pool.close_all().await;
    assert!(pool.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_pool_health_check_keeps_live_sessions() {
    let pool = SessionPool::new(
        Arc::new(RusshTransport),
        &options(AuthMethod::Password),
    );
    pool.acquire(&password_target()).await.unwrap();

    assert!(pool.health_check().await.is_empty());
    assert_eq!(pool.len(), 1);

    pool.close_all().await;
}
