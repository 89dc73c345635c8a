use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::utils::error::{AppError, Result};

type ShutdownFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Named shutdown steps run one after another once a termination signal
/// arrives. All steps share one deadline.
#[derive(Default)]
pub struct ShutdownHandler {
    steps: Vec<(String, ShutdownFn)>,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps
            .push((name.to_string(), Box::new(move || f().boxed())));
    }

    /// Wait for Ctrl-C or SIGTERM, then run every step.
    pub async fn listen(self, timeout: Duration) -> Result<()> {
        wait_for_signal().await?;
        tracing::info!("termination signal received");
        self.shutdown(timeout).await
    }

    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;

        for (name, step) in self.steps {
            let handle = tokio::spawn(step());
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(()))) => tracing::info!(name = %name, "shutdown complete"),
                Ok(Ok(Err(e))) => tracing::error!(name = %name, "shutdown error: {}", e),
                Ok(Err(e)) => tracing::error!(name = %name, "shutdown step panicked: {}", e),
                Err(_) => {
                    tracing::warn!(name = %name, "shutdown timeout");
                    timed_out = true;
                }
            }
        }

        if timed_out {
            return Err(AppError::Internal("shutdown deadline exceeded".to_string()));
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
