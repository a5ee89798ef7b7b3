use std::process::ExitCode;

use clap::Parser;
use eyre::Result;
use rexec_runtime::SessionPool;
use tokio_util::sync::CancellationToken;

use crate::{app::Args, executor::Executor, renderer::StreamingRenderer};

mod app;
mod executor;
mod renderer;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    rexec_runtime::init_tracing();

    let args = Args::parse();
    let config = args.pool_config()?;
    let targets = args.targets(&config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling running commands");
                cancel.cancel();
            }
        }
    });

    let pool = SessionPool::with_russh(&config);
    let executor = Executor::new(pool.clone(), targets, args.invocation(cancel));

    let mut renderer = StreamingRenderer::new();
    let outcomes = executor.execute(&mut renderer).await;
    renderer.summary(&outcomes)?;

    pool.close_all().await;

    if outcomes.iter().all(|outcome| outcome.succeeded()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
