use std::sync::Arc;
use std::time::Instant;

use rexec_runtime::{
    ExecError, Invocation, InvocationResult, OutputLine, SessionKey, SessionPool, Target,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::renderer::StreamingRenderer;

/// How the command went on one host
#[derive(Debug)]
pub struct HostOutcome {
    pub key: SessionKey,
    pub result: Result<InvocationResult, ExecError>,
}

impl HostOutcome {
    /// A non-zero exit counts as success when it was returned as a result,
    /// which only happens with `--warn`
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs one invocation on every target concurrently through a shared pool
pub struct Executor {
    pool: SessionPool,
    targets: Vec<Target>,
    invocation: Invocation,
}

impl Executor {
    pub fn new(pool: SessionPool, targets: Vec<Target>, invocation: Invocation) -> Self {
        Self {
            pool,
            targets,
            invocation,
        }
    }

    /// Outcomes come back in target order
    pub async fn execute(&self, renderer: &mut StreamingRenderer) -> Vec<HostOutcome> {
        let (line_tx, mut line_rx) = mpsc::channel::<(Arc<str>, OutputLine)>(256);
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for (index, target) in self.targets.iter().enumerate() {
            let label: Arc<str> = Arc::from(target.key().to_string());
            let (output_tx, mut output_rx) = mpsc::channel(64);

            // Tag this host's lines and merge them into the shared stream
            let line_tx = line_tx.clone();
            tasks.spawn({
                let label = label.clone();
                async move {
                    while let Some(line) = output_rx.recv().await {
                        if line_tx.send((label.clone(), line)).await.is_err() {
                            break;
                        }
                    }
                    None
                }
            });

            let mut invocation = self.invocation.clone();
            invocation.output = Some(output_tx);

            let pool = self.pool.clone();
            let target = target.clone();
            tasks.spawn(async move {
                tracing::debug!("Running `{}` on {label}", invocation.command);
                let result = pool.execute(&target, &invocation).await;
                Some((
                    index,
                    HostOutcome {
                        key: target.key(),
                        result,
                    },
                ))
            });
        }
        drop(line_tx);

        let mut outcomes: Vec<Option<HostOutcome>> =
            (0..self.targets.len()).map(|_| None).collect();

        loop {
            tokio::select! {
                Some((label, line)) = line_rx.recv() => {
                    if let Err(e) = renderer.host_line(&label, &line) {
                        tracing::warn!("Failed to write output: {e}");
                    }
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Some((index, outcome))) => outcomes[index] = Some(outcome),
                    Ok(None) => {}
                    Err(e) => tracing::error!("Host task failed: {e}"),
                },
                else => break,
            }
        }

        tracing::debug!(
            "Finished on {} hosts in {:?}",
            self.targets.len(),
            started.elapsed()
        );

        outcomes
            .into_iter()
            .zip(&self.targets)
            .map(|(outcome, target)| {
                outcome.unwrap_or_else(|| HostOutcome {
                    key: target.key(),
                    result: Err(ExecError::SessionClosed(target.key())),
                })
            })
            .collect()
    }
}
