//! Partner ETL operators and the quarterly workflow that sequences them.

mod aggregate;
mod ingest;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use petl_core::{DatasetSummary, GlobalSummary, PartnerId, Quarter};
use petl_sources::PassthroughOptions;
use petl_storage::{BlobStore, FsBlobStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub use aggregate::{DatasetStatsAggregator, GlobalStatsAggregator, SaveStats};
pub use ingest::{
    registry_source_factory, IngestSummary, PartnerIngestOperator, SourceFactory,
    DEFAULT_POSTINGS_PER_FILE,
};

pub const CRATE_NAME: &str = "petl-operators";

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub storage_root: PathBuf,
    pub output_prefix: String,
    pub partner_stats_path: String,
    pub onet_cache_dir: PathBuf,
    pub onet_storage_path: String,
    pub postings_per_file: usize,
    pub partners_file: PathBuf,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EtlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            storage_root: lookup("PETL_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./storage")),
            output_prefix: lookup("PETL_OUTPUT_PREFIX")
                .unwrap_or_else(|| "job_postings".to_string()),
            partner_stats_path: lookup("PETL_PARTNER_STATS_PATH")
                .unwrap_or_else(|| "stats/partner-etl".to_string()),
            onet_cache_dir: lookup("PETL_ONET_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./onet_cache")),
            onet_storage_path: lookup("PETL_ONET_STORAGE_PATH")
                .unwrap_or_else(|| "onet/taxonomy.json".to_string()),
            postings_per_file: lookup("PETL_POSTINGS_PER_FILE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_POSTINGS_PER_FILE),
            partners_file: lookup("PETL_PARTNERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./partners.yaml")),
            scheduler_enabled: lookup("PETL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            schedule_cron: lookup("PETL_SCHEDULE_CRON")
                .unwrap_or_else(|| "0 0 6 1 1,4,7,10 *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartnerRegistry {
    pub partners: Vec<PartnerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartnerConfig {
    pub partner_id: PartnerId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub source: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub options: PassthroughOptions,
}

fn enabled_by_default() -> bool {
    true
}

impl PartnerConfig {
    /// Human-readable name, falling back to the partner id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.partner_id.as_str())
    }
}

impl PartnerRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing partner registry")?;
        let mut seen = BTreeSet::new();
        for partner in &registry.partners {
            if !seen.insert(&partner.partner_id) {
                bail!("partner `{}` is listed more than once", partner.partner_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, partner_id: &PartnerId) -> Option<&PartnerConfig> {
        self.partners.iter().find(|p| &p.partner_id == partner_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PartnerConfig> {
        self.partners.iter().filter(|p| p.enabled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunSummary {
    pub run_id: Uuid,
    pub quarter: Quarter,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingests: Vec<IngestSummary>,
    pub partner_summaries: Vec<DatasetSummary>,
    pub global: GlobalSummary,
}

/// Runs ingest → partner aggregate → global aggregate for every enabled partner.
pub struct Workflow {
    config: EtlConfig,
    registry: PartnerRegistry,
    store: Arc<dyn BlobStore>,
}

impl Workflow {
    pub fn new(config: EtlConfig, registry: PartnerRegistry, store: Arc<dyn BlobStore>) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Filesystem-backed workflow using the configured registry file.
    pub async fn from_config(config: EtlConfig) -> Result<Self> {
        let registry = PartnerRegistry::load(&config.partners_file).await?;
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage_root.clone()));
        Ok(Self::new(config, registry, store))
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn registry(&self) -> &PartnerRegistry {
        &self.registry
    }

    pub fn ingest_operator(&self, partner_id: &PartnerId) -> Result<PartnerIngestOperator> {
        let partner = self
            .registry
            .get(partner_id)
            .with_context(|| format!("no partner registered as {partner_id}"))?;
        PartnerIngestOperator::new(
            partner.partner_id.clone(),
            registry_source_factory(partner.source.clone(), partner.options.clone()),
            &self.config,
        )
    }

    pub async fn ingest(&self, partner_id: &PartnerId, execution_date: NaiveDate) -> Result<IngestSummary> {
        self.ingest_operator(partner_id)?
            .execute(self.store.clone(), execution_date)
            .await
    }

    pub async fn aggregate_partner(&self, partner_id: &PartnerId) -> Result<DatasetSummary> {
        DatasetStatsAggregator::new(partner_id.clone(), self.store.clone())
            .run(&self.config.partner_stats_path)
            .await
    }

    pub async fn aggregate_global(&self) -> Result<GlobalSummary> {
        GlobalStatsAggregator::new(self.store.clone())
            .run(&self.config.partner_stats_path)
            .await
    }

    pub async fn run(&self, execution_date: NaiveDate) -> Result<WorkflowRunSummary> {
        let run_id = Uuid::new_v4();
        let quarter = Quarter::from_date(&execution_date);
        let span = info_span!("workflow_run", %run_id, %quarter);
        self.run_stages(run_id, quarter, execution_date)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        quarter: Quarter,
        execution_date: NaiveDate,
    ) -> Result<WorkflowRunSummary> {
        let started_at = Utc::now();
        let partners: Vec<PartnerId> = self
            .registry
            .enabled()
            .map(|p| p.partner_id.clone())
            .collect();
        info!(partners = partners.len(), "starting workflow run");

        let mut ingests = Vec::with_capacity(partners.len());
        for partner_id in &partners {
            let summary = self
                .ingest(partner_id, execution_date)
                .await
                .with_context(|| format!("ingesting {partner_id} for {quarter}"))?;
            ingests.push(summary);
        }

        let mut partner_summaries = Vec::with_capacity(partners.len());
        for partner_id in &partners {
            let summary = self
                .aggregate_partner(partner_id)
                .await
                .with_context(|| format!("aggregating stats for {partner_id}"))?;
            partner_summaries.push(summary);
        }

        let global = self.aggregate_global().await.context("aggregating global stats")?;
        let finished_at = Utc::now();
        info!(total = global.total, "workflow run complete");

        Ok(WorkflowRunSummary {
            run_id,
            quarter,
            started_at,
            finished_at,
            ingests,
            partner_summaries,
            global,
        })
    }
}

/// Registers the quarterly workflow on the configured cron; `None` when scheduling is off.
pub async fn maybe_build_scheduler(workflow: Arc<Workflow>) -> Result<Option<JobScheduler>> {
    if !workflow.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = workflow.config().schedule_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let workflow = workflow.clone();
        Box::pin(async move {
            let execution_date = Utc::now().date_naive();
            match workflow.run(execution_date).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    quarter = %summary.quarter,
                    total = summary.global.total,
                    "scheduled workflow run finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled workflow run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
