//! PostgREST metadata client.
//!
//! Endpoint: GET {url}/rest/v1/{table}?{group_column}=eq.{group}&order=...
//! Auth: `apikey` header plus Bearer token

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{sort_records, MetadataStore};
use crate::domain::RecordBatch;

/// Metadata store backed by a PostgREST-compatible HTTP API
pub struct PostgrestMetadataStore {
    base_url: String,
    api_key: String,
    table: String,
    group_column: String,
    order_column: String,
    client: reqwest::Client,
}

impl PostgrestMetadataStore {
    /// Create a new client for `table`
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: table.into(),
            group_column: "game_id".to_string(),
            order_column: "start_timestamp".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the filter and ordering columns
    pub fn with_columns(mut self, group_column: impl Into<String>, order_column: impl Into<String>) -> Self {
        self.group_column = group_column.into();
        self.order_column = order_column.into();
        self
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.base_url.trim_end_matches('/'),
            self.table
        )
    }
}

#[async_trait]
impl MetadataStore for PostgrestMetadataStore {
    fn name(&self) -> &str {
        "postgrest"
    }

    async fn fetch_records(&self, group_id: &str) -> Result<RecordBatch> {
        let url = self.table_url();
        debug!(url = %url, group_id, "Fetching annotation records");

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&[
                ("select", "*".to_string()),
                (self.group_column.as_str(), format!("eq.{}", group_id)),
                ("order", format!("{}.asc", self.order_column)),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to query {} for group {}", self.table, group_id))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Metadata store error ({}): {}", status, text);
        }

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .context("Failed to parse annotation records")?;

        let mut batch = RecordBatch::from_rows(rows);
        // Upstream ordering is not guaranteed for equal or null offsets
        sort_records(&mut batch.records);
        Ok(batch)
    }
}
