//! Stats persistence and the two aggregation fan-in stages.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use petl_core::{
    dataset_summaries_prefix, dataset_summary_key, global_summary_key, quarterly_stats_key,
    quarterly_stats_prefix, DatasetStats, DatasetStatsCounter, DatasetSummary, GlobalSummary,
    PartnerId,
};
use petl_storage::{get_json, put_json, BlobStore};
use tracing::{info, info_span, Instrument};

#[async_trait]
pub trait SaveStats {
    /// Persist under the stats prefix, overwriting any earlier record; returns the key.
    async fn save(&self, store: &dyn BlobStore, stats_prefix: &str) -> Result<String>;
}

#[async_trait]
impl SaveStats for DatasetStatsCounter {
    async fn save(&self, store: &dyn BlobStore, stats_prefix: &str) -> Result<String> {
        let stats = self.stats();
        let key = quarterly_stats_key(stats_prefix, stats.quarter, &stats.dataset_id);
        put_json(store, &key, stats).await?;
        Ok(key)
    }
}

/// Reduces every quarterly stats record of one partner into its dataset summary.
pub struct DatasetStatsAggregator {
    dataset_id: PartnerId,
    store: Arc<dyn BlobStore>,
}

impl DatasetStatsAggregator {
    pub fn new(dataset_id: PartnerId, store: Arc<dyn BlobStore>) -> Self {
        Self { dataset_id, store }
    }

    pub async fn run(&self, stats_prefix: &str) -> Result<DatasetSummary> {
        let span = info_span!("partner_aggregate", partner_id = %self.dataset_id);
        self.aggregate(stats_prefix).instrument(span).await
    }

    async fn aggregate(&self, stats_prefix: &str) -> Result<DatasetSummary> {
        let suffix = format!("/{}.json", self.dataset_id);
        let keys = self
            .store
            .list(&quarterly_stats_prefix(stats_prefix))
            .await
            .context("listing quarterly stats")?;

        let mut records = Vec::new();
        for key in keys.iter().filter(|key| key.ends_with(&suffix)) {
            let record: DatasetStats = get_json(self.store.as_ref(), key).await?;
            records.push(record);
        }
        info!(records = records.len(), "loaded quarterly stats");

        let summary = DatasetSummary::from_stats(self.dataset_id.clone(), records);
        let key = dataset_summary_key(stats_prefix, &self.dataset_id);
        put_json(self.store.as_ref(), &key, &summary).await?;
        info!(total = summary.total, quarters = summary.quarters.len(), %key, "partner aggregate written");
        Ok(summary)
    }
}

/// Reduces every partner's dataset summary into the global summary.
pub struct GlobalStatsAggregator {
    store: Arc<dyn BlobStore>,
}

impl GlobalStatsAggregator {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn run(&self, stats_prefix: &str) -> Result<GlobalSummary> {
        self.aggregate(stats_prefix)
            .instrument(info_span!("global_aggregate"))
            .await
    }

    async fn aggregate(&self, stats_prefix: &str) -> Result<GlobalSummary> {
        let keys = self
            .store
            .list(&dataset_summaries_prefix(stats_prefix))
            .await
            .context("listing dataset summaries")?;

        let mut summaries = Vec::new();
        for key in keys.iter().filter(|key| key.ends_with(".json")) {
            let summary: DatasetSummary = get_json(self.store.as_ref(), key).await?;
            summaries.push(summary);
        }

        let global = GlobalSummary::from_summaries(summaries);
        let key = global_summary_key(stats_prefix);
        put_json(self.store.as_ref(), &key, &global).await?;
        info!(total = global.total, partners = global.partners.len(), %key, "global aggregate written");
        Ok(global)
    }
}
