//! An in-memory transport that understands a tiny shell dialect.
//!
//! Supported commands, separated by `;` or newlines: `echo ARGS`, `warn ARGS`
//! (to stderr), `sleep SECS`, `cat` (echoes stdin), `true`, `false`,
//! `exit N` and `export NAME='VALUE'`. Words starting with `$` are expanded
//! from exported variables.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::config::ConnectOptions;
use crate::error::TransportError;
use crate::target::Target;
use crate::transport::{ChannelEvent, Connection, Signal, Transport};

#[derive(Default)]
struct Shared {
    opens: AtomicUsize,
    opening: AtomicUsize,
    max_opening: AtomicUsize,
    closes: AtomicUsize,
    generation: AtomicUsize,
    exec_failures: AtomicUsize,
    open_failures: Mutex<VecDeque<TransportError>>,
    connect_delays: Mutex<HashMap<String, Duration>>,
    keepalive_delay: Mutex<Option<Duration>>,
    signals: Mutex<Vec<Signal>>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every open for `host` take `delay`
    pub fn with_connect_delay(self, host: &str, delay: Duration) -> Self {
        self.shared
            .connect_delays
            .lock()
            .unwrap()
            .insert(host.to_string(), delay);
        self
    }

    /// Make every keepalive take `delay`
    pub fn with_keepalive_delay(self, delay: Duration) -> Self {
        *self.shared.keepalive_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Number of open attempts so far
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Most opens ever in flight at the same time
    pub fn max_concurrent_opens(&self) -> usize {
        self.shared.max_opening.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.shared.signals.lock().unwrap().clone()
    }

    pub fn fail_next_open(&self, err: TransportError) {
        self.shared.open_failures.lock().unwrap().push_back(err);
    }

    /// The next exec on any connection fails as if the link dropped
    pub fn fail_next_exec(&self) {
        self.shared.exec_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Every connection opened so far stops answering
    pub fn kill_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        target: &Target,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let _opening = Opening::enter(&self.shared);

        let delay = self
            .shared
            .connect_delays
            .lock()
            .unwrap()
            .get(target.host())
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.shared.open_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok(Box::new(ScriptedConnection {
            generation: self.shared.generation.load(Ordering::SeqCst),
            shared: self.shared.clone(),
            steps: VecDeque::new(),
            stdin: BytesMut::new(),
        }))
    }
}

/// Counts an open in flight until dropped, including when abandoned
struct Opening<'a>(&'a Shared);

impl<'a> Opening<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.opening.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_opening.fetch_max(now, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        self.0.opening.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Step {
    Stdout(Bytes),
    Stderr(Bytes),
    Sleep(Duration),
    Cat,
    Exit(i32),
}

struct ScriptedConnection {
    shared: Arc<Shared>,
    generation: usize,
    steps: VecDeque<Step>,
    stdin: BytesMut,
}

impl ScriptedConnection {
    fn is_dead(&self) -> bool {
        self.generation != self.shared.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        if self.is_dead() {
            return Err(TransportError::Closed);
        }
        let failing = self
            .shared
            .exec_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Network("connection reset by peer".into()));
        }

        self.stdin.clear();
        self.steps = script(command);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stdin.extend_from_slice(data);
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ChannelEvent>, TransportError> {
        loop {
            if self.is_dead() {
                return Err(TransportError::Closed);
            }

            if let Some(Step::Sleep(duration)) = self.steps.front() {
                tokio::time::sleep(*duration).await;
                self.steps.pop_front();
                continue;
            }

            let event = match self.steps.pop_front() {
                None => return Ok(None),
                Some(Step::Stdout(data)) => ChannelEvent::Stdout(data),
                Some(Step::Stderr(data)) => ChannelEvent::Stderr(data),
                Some(Step::Cat) => ChannelEvent::Stdout(self.stdin.split().freeze()),
                Some(Step::Exit(code)) => ChannelEvent::Exit(code),
                Some(Step::Sleep(_)) => continue,
            };
            return Ok(Some(event));
        }
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), TransportError> {
        self.shared.signals.lock().unwrap().push(signal);
        Ok(())
    }

    async fn close_channel(&mut self) {
        self.steps.clear();
    }

    async fn keepalive(&mut self) -> bool {
        let delay = *self.shared.keepalive_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        !self.is_dead()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn script(command_line: &str) -> VecDeque<Step> {
    let mut env = HashMap::new();
    let mut steps = VecDeque::new();
    let mut code = 0;

    for part in command_line.split(['\n', ';']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, args) = part.split_once(' ').unwrap_or((part, ""));

        code = 0;
        match name {
            "export" => {
                if let Some((key, value)) = args.split_once('=') {
                    env.insert(key.to_string(), value.trim_matches('\'').to_string());
                }
            }
            "echo" => steps.push_back(Step::Stdout(expand(args, &env))),
            "warn" => steps.push_back(Step::Stderr(expand(args, &env))),
            "sleep" => {
                let secs = args.parse::<f64>().unwrap_or(0.0);
                steps.push_back(Step::Sleep(Duration::from_secs_f64(secs)));
            }
            "cat" => steps.push_back(Step::Cat),
            "true" => {}
            "false" => code = 1,
            "exit" => {
                code = args.parse().unwrap_or(0);
                break;
            }
            other => {
                steps.push_back(Step::Stderr(Bytes::from(format!(
                    "sh: {other}: command not found\n"
                ))));
                code = 127;
            }
        }
    }

    steps.push_back(Step::Exit(code));
    steps
}

fn expand(args: &str, env: &HashMap<String, String>) -> Bytes {
    let words: Vec<&str> = args
        .split_whitespace()
        .map(|word| match word.strip_prefix('$') {
            Some(name) => env.get(name).map(String::as_str).unwrap_or(""),
            None => word,
        })
        .collect();
    Bytes::from(format!("{}\n", words.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_script_parsing() {
        let steps = script("export NAME='world'\necho hello $NAME; false");
        let rendered: Vec<String> = steps.iter().map(|s| format!("{s:?}")).collect();
        assert_eq!(
            rendered,
            vec![
                format!("{:?}", Step::Stdout(Bytes::from_static(b"hello world\n"))),
                format!("{:?}", Step::Exit(1)),
            ]
        );
    }
}
