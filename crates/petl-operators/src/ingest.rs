//! Partner ingest: clear a partner-quarter, stream its postings into NDJSON batch blobs,
//! and persist the folded stats.

use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use futures::TryStreamExt;
use petl_core::{batch_key_prefix, BatchRecord, DatasetStatsCounter, PartnerId, Posting, Quarter};
use petl_sources::{
    source_for_kind, PassthroughOptions, PostingSource, SourceContext, SourceError,
};
use petl_storage::{delete_prefix, sha256_hex, BlobStore, ReferenceCache};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::aggregate::SaveStats;
use crate::EtlConfig;

pub const DEFAULT_POSTINGS_PER_FILE: usize = 10_000;

/// Builds the posting source for one execution from the shared collaborators.
pub type SourceFactory =
    Arc<dyn Fn(SourceContext) -> Result<Box<dyn PostingSource>, SourceError> + Send + Sync>;

/// Factory resolving a registry source kind with its passthrough options.
pub fn registry_source_factory(kind: impl Into<String>, options: PassthroughOptions) -> SourceFactory {
    let kind = kind.into();
    Arc::new(move |ctx: SourceContext| source_for_kind(&kind, ctx, &options))
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub partner_id: PartnerId,
    pub quarter: Quarter,
    pub cleared_blobs: usize,
    pub total_postings: u64,
    pub batches: Vec<BatchRecord>,
    pub stats_key: String,
}

pub struct PartnerIngestOperator {
    partner_id: PartnerId,
    source_factory: SourceFactory,
    output_prefix: String,
    stats_prefix: String,
    onet_cache_dir: std::path::PathBuf,
    onet_storage_path: String,
    postings_per_file: usize,
}

impl PartnerIngestOperator {
    pub fn new(partner_id: PartnerId, source_factory: SourceFactory, config: &EtlConfig) -> Result<Self> {
        if config.postings_per_file == 0 {
            bail!("postings_per_file must be at least 1");
        }
        Ok(Self {
            partner_id,
            source_factory,
            output_prefix: config.output_prefix.clone(),
            stats_prefix: config.partner_stats_path.clone(),
            onet_cache_dir: config.onet_cache_dir.clone(),
            onet_storage_path: config.onet_storage_path.clone(),
            postings_per_file: config.postings_per_file,
        })
    }

    pub fn partner_id(&self) -> &PartnerId {
        &self.partner_id
    }

    pub async fn execute(
        &self,
        store: Arc<dyn BlobStore>,
        execution_date: NaiveDate,
    ) -> Result<IngestSummary> {
        let quarter = Quarter::from_date(&execution_date);
        let span = info_span!("partner_ingest", partner_id = %self.partner_id, %quarter);
        self.run(store, quarter).instrument(span).await
    }

    async fn run(&self, store: Arc<dyn BlobStore>, quarter: Quarter) -> Result<IngestSummary> {
        let cleared_blobs = self.clear_old_postings(store.as_ref(), quarter).await?;

        let reference_cache = Arc::new(ReferenceCache::new(
            store.clone(),
            &self.onet_cache_dir,
            self.onet_storage_path.clone(),
        ));
        let source = (self.source_factory)(SourceContext {
            store: store.clone(),
            partner_id: self.partner_id.clone(),
            reference_cache,
        })
        .with_context(|| format!("building posting source for {}", self.partner_id))?;
        if source.partner_id() != &self.partner_id {
            bail!(
                "{} source was built for {}, expected {}",
                source.kind(),
                source.partner_id(),
                self.partner_id
            );
        }

        let mut postings = source
            .postings(quarter)
            .await
            .with_context(|| format!("opening {} postings for {quarter}", source.kind()))?;
        let mut counter = DatasetStatsCounter::new(quarter, self.partner_id.clone());
        let mut batch = Vec::with_capacity(self.postings_per_file.min(DEFAULT_POSTINGS_PER_FILE));

        while let Some(posting) = postings
            .try_next()
            .await
            .with_context(|| format!("reading {} postings for {quarter}", source.kind()))?
        {
            counter.track(&posting);
            batch.push(posting);
            if batch.len() == self.postings_per_file {
                let record = self.upload_batch(store.as_ref(), quarter, &batch).await?;
                counter.record_batch(record);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            let record = self.upload_batch(store.as_ref(), quarter, &batch).await?;
            counter.record_batch(record);
        }

        let stats_key = counter.save(store.as_ref(), &self.stats_prefix).await?;
        let stats = counter.into_stats();
        info!(
            postings = stats.total,
            batches = stats.batches.len(),
            %stats_key,
            "partner ingest complete"
        );

        Ok(IngestSummary {
            partner_id: self.partner_id.clone(),
            quarter,
            cleared_blobs,
            total_postings: stats.total,
            batches: stats.batches,
            stats_key,
        })
    }

    /// Remove every batch blob previously written for this partner-quarter.
    pub async fn clear_old_postings(&self, store: &dyn BlobStore, quarter: Quarter) -> Result<usize> {
        let prefix = batch_key_prefix(&self.output_prefix, quarter, &self.partner_id);
        info!(%prefix, "clearing out old postings");
        let removed = delete_prefix(store, &prefix)
            .await
            .with_context(|| format!("clearing {prefix}"))?;
        info!(removed, "done deleting old postings");
        Ok(removed)
    }

    async fn upload_batch(
        &self,
        store: &dyn BlobStore,
        quarter: Quarter,
        batch: &[Posting],
    ) -> Result<BatchRecord> {
        debug!(postings = batch.len(), "processing new batch");
        let bytes = write_batch_file(batch).await?;

        let key = format!(
            "{}{}",
            batch_key_prefix(&self.output_prefix, quarter, &self.partner_id),
            Uuid::new_v4()
        );
        let record = BatchRecord {
            key: key.clone(),
            postings: batch.len() as u64,
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        store
            .put(&key, bytes)
            .await
            .with_context(|| format!("uploading batch {key}"))?;
        debug!(%key, "batch upload complete");
        Ok(record)
    }
}

/// Serialize a batch as NDJSON through an anonymous temp file and return its contents.
/// The file is unlinked on creation and released when this returns, on any path.
async fn write_batch_file(batch: &[Posting]) -> Result<Vec<u8>> {
    let file = tempfile::tempfile().context("creating temporary batch file")?;
    let mut writer = BufWriter::new(tokio::fs::File::from_std(file));
    for posting in batch {
        let mut line = serde_json::to_vec(posting).context("serializing posting")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("writing temporary batch file")?;
    }
    writer.flush().await.context("flushing temporary batch file")?;

    let mut file = writer.into_inner();
    file.seek(SeekFrom::Start(0))
        .await
        .context("rewinding temporary batch file")?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .await
        .context("reading temporary batch file")?;
    Ok(bytes)
}
