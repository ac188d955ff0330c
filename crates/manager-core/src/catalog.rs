use serde::Serialize;

/// Periodic summary PUT to the external catalog/discovery service (§6).
/// Grounded in `client-engine/src/backend.rs`'s `fetch_work`/`submit_job`
/// POST+JSON pattern — a thin `reqwest` client plus a typed request body.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub address: String,
    pub port: u16,
    pub ssl: bool,
    pub project: String,
    pub owner: String,
    pub workers: u32,
    pub tasks_running: u32,
    pub tasks_waiting: u32,
    pub total_cores: f64,
    pub committed_cores: f64,
    pub categories: Vec<String>,
}

impl CatalogSummary {
    /// §6: if the full document exceeds the size budget, a lean variant
    /// (no per-category breakdown) is sent instead.
    pub fn lean(&self) -> Self {
        Self { categories: Vec::new(), ..self.clone() }
    }

    fn approx_wire_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(usize::MAX)
    }
}

const CATALOG_SIZE_BUDGET_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait::async_trait]
pub trait CatalogPublisher: Send + Sync {
    async fn publish(&self, host: &str, summary: &CatalogSummary) -> Result<(), CatalogError>;
}

pub struct HttpCatalogPublisher {
    client: reqwest::Client,
}

impl HttpCatalogPublisher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpCatalogPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CatalogPublisher for HttpCatalogPublisher {
    async fn publish(&self, host: &str, summary: &CatalogSummary) -> Result<(), CatalogError> {
        let body = if summary.approx_wire_bytes() > CATALOG_SIZE_BUDGET_BYTES {
            summary.lean()
        } else {
            summary.clone()
        };
        self.client.put(host).json(&body).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CatalogSummary {
        CatalogSummary {
            address: "10.0.0.1".into(),
            port: 9000,
            ssl: false,
            project: "proj".into(),
            owner: "me".into(),
            workers: 3,
            tasks_running: 1,
            tasks_waiting: 2,
            total_cores: 16.0,
            committed_cores: 4.0,
            categories: vec!["default".into()],
        }
    }

    #[test]
    fn lean_variant_drops_categories() {
        let s = sample();
        assert!(!s.lean().categories.iter().any(|_| true));
    }
}
