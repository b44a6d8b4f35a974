//! Unit invokers: how the orchestrator starts one extraction unit per group.
//!
//! - `HttpUnitInvoker`: POST `{"group_id": ...}` to a remote unit endpoint
//! - `SpawnUnitInvoker`: run the unit as a task in this process
//! - `NoDispatchInvoker`: refuses every invocation, for orchestrator work
//!   that only reads storage (audit)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::UnitInvoker;
use crate::core::ExtractionUnit;

/// What is known about an invocation after it was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// The endpoint (or runtime) accepted the invocation
    Accepted,

    /// The request went out but no response arrived in time; the unit may
    /// well be running
    Unconfirmed,
}

/// Request body for the unit endpoint
#[derive(Debug, Serialize)]
struct InvokePayload<'a> {
    group_id: &'a str,
}

/// Invokes units over HTTP
pub struct HttpUnitInvoker {
    endpoint: String,
    token: Option<String>,
    dispatch_timeout: Duration,
    client: reqwest::Client,
}

impl HttpUnitInvoker {
    /// Create a new invoker. `dispatch_timeout` bounds how long we wait for
    /// the endpoint to answer, not how long the unit runs.
    pub fn new(endpoint: impl Into<String>, dispatch_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            dispatch_timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl UnitInvoker for HttpUnitInvoker {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, group_id: &str) -> Result<Dispatch> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.dispatch_timeout)
            .json(&InvokePayload { group_id });

        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(
                    group_id,
                    timeout = ?self.dispatch_timeout,
                    "Unit endpoint did not answer in time; assuming it is running"
                );
                return Ok(Dispatch::Unconfirmed);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to invoke unit for group {}", group_id))
            }
        };

        let status = response.status();
        if status.is_success() {
            Ok(Dispatch::Accepted)
        } else {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Unit endpoint error ({}): {}", status, text)
        }
    }
}

/// Runs units as background tasks in this process, at most
/// `max_concurrent` at a time.
pub struct SpawnUnitInvoker {
    unit: Arc<ExtractionUnit>,
    permits: Arc<Semaphore>,
}

impl SpawnUnitInvoker {
    pub fn new(unit: Arc<ExtractionUnit>, max_concurrent: usize) -> Self {
        Self {
            unit,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl UnitInvoker for SpawnUnitInvoker {
    fn name(&self) -> &str {
        "spawn"
    }

    async fn invoke(&self, group_id: &str) -> Result<Dispatch> {
        let unit = Arc::clone(&self.unit);
        let permits = Arc::clone(&self.permits);
        let group_id = group_id.to_string();

        // The permit is taken inside the task so dispatch never blocks
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                error!(group_id = %group_id, "Unit semaphore closed; unit not started");
                return;
            };

            match unit.run_extraction(&group_id).await {
                Ok(result) => info!(
                    group_id = %group_id,
                    outcome = ?result.outcome,
                    clips_extracted = result.clips_extracted,
                    "Unit finished"
                ),
                Err(e) => warn!(group_id = %group_id, error = %e, "Unit failed"),
            }
        });

        Ok(Dispatch::Accepted)
    }
}

/// Invoker for orchestrators that must never start a unit
pub struct NoDispatchInvoker;

#[async_trait]
impl UnitInvoker for NoDispatchInvoker {
    fn name(&self) -> &str {
        "none"
    }

    async fn invoke(&self, group_id: &str) -> Result<Dispatch> {
        anyhow::bail!("Dispatch is disabled; group {} not started", group_id)
    }
}
