use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use ydsync_core::YadiskClient;

use crate::config::EngineConfig;
use crate::sync::engine::SyncEngine;
use crate::sync::executor::ShutdownMode;
use crate::sync::remote::YadiskRemote;
use crate::sync::status::{StatusEvent, SyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Watch and synchronize until interrupted.
    Watch,
    /// One reconciliation pass, then exit.
    Once,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub token: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let token = std::env::var("YADISK_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .context("YADISK_TOKEN is not set")?;
        let engine = EngineConfig::from_env().context("invalid sync configuration")?;
        Ok(Self { engine, token })
    }
}

pub struct DaemonRuntime {
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.engine.root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.engine.root))?;

        let client = YadiskClient::new(config.token).context("failed to build API client")?;
        let remote = YadiskRemote::new(client, config.engine.work_dir.clone())
            .with_poll_interval(config.engine.poll_interval);
        let engine = SyncEngine::open(config.engine, Arc::new(remote))
            .await
            .context("failed to open sync engine")?;
        Ok(Self::from_engine(engine))
    }

    pub fn from_engine(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, mode: RunMode) -> anyhow::Result<()> {
        tracing::info!(root = %self.engine.root().display(), ?mode, "ydsyncd started");
        let reporter = tokio::spawn(report_events(self.engine.subscribe()));

        let result = match mode {
            RunMode::Once => self.run_once().await,
            RunMode::Watch => self.run_until_signal().await,
        };

        self.engine.shutdown(ShutdownMode::Drain).await;
        if let Err(err) = reporter.await {
            tracing::error!(error = %err, "status reporter aborted");
        }
        tracing::info!("ydsyncd stopped");
        result
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        match self.engine.connect().await? {
            SyncState::Fault => anyhow::bail!(
                "sync root {} is not accessible",
                self.engine.root().display()
            ),
            SyncState::NoNet => anyhow::bail!("Yandex Disk is unreachable"),
            _ => {}
        }
        let settled = self.engine.wait_settled().await;
        tracing::info!(status = %self.engine.status_line(), "reconciliation finished");
        if settled == SyncState::Error {
            anyhow::bail!("synchronization finished with errors");
        }
        Ok(())
    }

    async fn run_until_signal(&self) -> anyhow::Result<()> {
        let state = self.engine.connect().await?;
        if state == SyncState::Fault {
            anyhow::bail!(
                "sync root {} is not accessible",
                self.engine.root().display()
            );
        }

        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")?;
                tracing::info!("interrupted, shutting down");
            }
            _ = terminate.recv() => {
                tracing::info!("terminated, shutting down");
            }
        }
        Ok(())
    }
}

/// Logs status notifications until the engine exits.
async fn report_events(mut events: broadcast::Receiver<StatusEvent>) {
    loop {
        match events.recv().await {
            Ok(StatusEvent::Status { state, previous }) => {
                tracing::debug!(state = %state, previous = %previous, "status");
                if state == SyncState::Exit {
                    break;
                }
            }
            Ok(StatusEvent::Progress { outstanding }) => {
                tracing::trace!(outstanding, "progress");
            }
            Ok(StatusEvent::Last(paths)) => {
                tracing::info!(count = paths.len(), latest = ?paths.first(), "recently uploaded");
            }
            Ok(StatusEvent::Quota(quota)) => {
                tracing::info!(
                    used = quota.used,
                    total = quota.total,
                    trash = quota.trash,
                    "quota"
                );
            }
            Ok(StatusEvent::Conflict { path }) => {
                tracing::warn!(path = %path, "conflicting changes detected");
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "status reporter lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
