//! Sanity checks run before any worker is started.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sjs_core::SjsConfig;
use tracing::info;

use crate::probe::QueueProbe;

#[async_trait]
pub trait PreChecks: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Validates the config and makes one round trip to the queue backend.
pub struct BackendPreChecks {
    config: SjsConfig,
    probe: Arc<dyn QueueProbe>,
}

impl BackendPreChecks {
    pub fn new(config: SjsConfig, probe: Arc<dyn QueueProbe>) -> Self {
        Self { config, probe }
    }
}

#[async_trait]
impl PreChecks for BackendPreChecks {
    async fn run(&self) -> anyhow::Result<()> {
        self.config.validate()?;
        let pending = self
            .probe
            .pending_job_count()
            .await
            .with_context(|| format!("queue backend at {} unreachable", self.config.redis.url()))?;
        info!(queue = %self.config.queue, pending, "queue backend reachable");
        Ok(())
    }
}
