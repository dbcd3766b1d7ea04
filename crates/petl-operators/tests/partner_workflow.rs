use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use petl_core::{DatasetStats, PartnerId, Posting, Quarter};
use petl_operators::{
    EtlConfig, PartnerIngestOperator, PartnerRegistry, SourceFactory, Workflow,
};
use petl_sources::{PostingSource, PostingStream, SourceContext, SourceError};
use petl_storage::{get_json, BlobStore, MemoryBlobStore, StorageError};
use serde_json::{json, Value};
use tempfile::tempdir;

const TAXONOMY_KEY: &str = "onet/taxonomy.json";

/// Wraps the in-memory store and counts reads of the taxonomy blob.
#[derive(Default)]
struct CountingStore {
    inner: MemoryBlobStore,
    taxonomy_gets: AtomicUsize,
}

#[async_trait]
impl BlobStore for CountingStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if key == TAXONOMY_KEY {
            self.taxonomy_gets.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

struct SyntheticSource {
    partner_id: PartnerId,
    count: usize,
}

#[async_trait]
impl PostingSource for SyntheticSource {
    fn kind(&self) -> &'static str {
        "synthetic"
    }

    fn partner_id(&self) -> &PartnerId {
        &self.partner_id
    }

    async fn postings(&self, quarter: Quarter) -> Result<PostingStream, SourceError> {
        let partner = self.partner_id.to_string();
        let quarter = quarter.to_string();
        Ok(stream::iter(0..self.count)
            .map(move |n| {
                Posting::try_from(json!({
                    "id": format!("{partner}-{quarter}-{n}"),
                    "title": format!("Synthetic Posting {n}"),
                }))
                .map_err(|err| SourceError::Anyhow(err.into()))
            })
            .boxed())
    }
}

fn synthetic(count: usize) -> SourceFactory {
    Arc::new(move |ctx: SourceContext| {
        Ok(Box::new(SyntheticSource {
            partner_id: ctx.partner_id,
            count,
        }) as Box<dyn PostingSource>)
    })
}

fn config(root: &Path, postings_per_file: usize) -> EtlConfig {
    EtlConfig {
        output_prefix: "prefix".to_string(),
        partner_stats_path: "stats".to_string(),
        onet_cache_dir: root.join("onet_cache"),
        onet_storage_path: TAXONOMY_KEY.to_string(),
        postings_per_file,
        ..EtlConfig::default()
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("date")
}

async fn line_count(store: &dyn BlobStore, keys: &[String]) -> usize {
    let mut lines = 0;
    for key in keys {
        let bytes = store.get(key).await.expect("batch blob");
        let text = String::from_utf8(bytes).expect("utf-8");
        for line in text.lines() {
            let _: Value = serde_json::from_str(line).expect("json line");
            lines += 1;
        }
    }
    lines
}

#[tokio::test]
async fn twenty_five_thousand_postings_land_in_three_batches() {
    let dir = tempdir().expect("tempdir");
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let operator = PartnerIngestOperator::new(
        PartnerId::new("P1").expect("partner"),
        synthetic(25_000),
        &config(dir.path(), 10_000),
    )
    .expect("operator");

    let summary = operator
        .execute(store.clone(), date(2013, 5, 1))
        .await
        .expect("ingest");

    let keys = store.list("prefix/2013Q2/P1_").await.expect("list");
    assert_eq!(keys.len(), 3);
    assert_eq!(line_count(store.as_ref(), &keys).await, 25_000);
    let mut sizes: Vec<u64> = summary.batches.iter().map(|b| b.postings).collect();
    sizes.sort();
    assert_eq!(sizes, vec![5_000, 10_000, 10_000]);

    let stats_keys = store.list("stats/quarterly/").await.expect("list");
    assert_eq!(stats_keys, vec!["stats/quarterly/2013Q2/P1.json"]);
    let stats: DatasetStats = get_json(store.as_ref(), &stats_keys[0]).await.expect("stats");
    assert_eq!(stats.total, 25_000);
    assert_eq!(stats.quarter.to_string(), "2013Q2");
}

#[tokio::test]
async fn rerun_replaces_previous_batches_for_the_partition() {
    let dir = tempdir().expect("tempdir");
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let partner = PartnerId::new("P1").expect("partner");

    // Neighbouring partition and partner that must survive the clear.
    store
        .put("prefix/2013Q3/P1_keep", b"{}\n".to_vec())
        .await
        .expect("put");
    store
        .put("prefix/2013Q2/P10_keep", b"{}\n".to_vec())
        .await
        .expect("put");

    let first = PartnerIngestOperator::new(partner.clone(), synthetic(5), &config(dir.path(), 2))
        .expect("operator")
        .execute(store.clone(), date(2013, 4, 1))
        .await
        .expect("first ingest");
    assert_eq!(first.batches.len(), 3);

    let second = PartnerIngestOperator::new(partner, synthetic(3), &config(dir.path(), 2))
        .expect("operator")
        .execute(store.clone(), date(2013, 6, 30))
        .await
        .expect("second ingest");
    assert_eq!(second.cleared_blobs, 3);

    let keys = store.list("prefix/2013Q2/P1_").await.expect("list");
    let expected: Vec<String> = {
        let mut keys: Vec<String> = second.batches.iter().map(|b| b.key.clone()).collect();
        keys.sort();
        keys
    };
    assert_eq!(keys, expected);
    assert_eq!(line_count(store.as_ref(), &keys).await, 3);
    assert!(first.batches.iter().all(|b| !keys.contains(&b.key)));

    assert!(store.get("prefix/2013Q3/P1_keep").await.is_ok());
    assert!(store.get("prefix/2013Q2/P10_keep").await.is_ok());

    let stats: DatasetStats = get_json(store.as_ref(), "stats/quarterly/2013Q2/P1.json")
        .await
        .expect("stats");
    assert_eq!(stats.total, 3);
}

fn write_fixture(fixtures: &Path, partner: &str, quarter: &str, count: usize) {
    let postings: Vec<Value> = (0..count)
        .map(|n| {
            json!({
                "id": format!("{partner}-{quarter}-{n}"),
                "title": format!("Posting {n}"),
                "onet_soc_code": if n % 2 == 0 { "29-1141.00" } else { "15-1132.00" },
            })
        })
        .collect();
    let dir = fixtures.join(partner);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(
        dir.join(format!("{quarter}.json")),
        serde_json::to_vec(&postings).expect("serialize"),
    )
    .expect("write fixture");
}

fn quarter(s: &str) -> Quarter {
    s.parse().expect("quarter")
}

#[tokio::test]
async fn workflow_reruns_do_not_duplicate_and_new_quarters_add() {
    let dir = tempdir().expect("tempdir");
    let fixtures = dir.path().join("fixtures");
    write_fixture(&fixtures, "P1", "2013Q2", 4);
    write_fixture(&fixtures, "P1", "2013Q3", 2);
    write_fixture(&fixtures, "P2", "2013Q2", 3);
    write_fixture(&fixtures, "P2", "2013Q3", 5);

    let store = Arc::new(CountingStore::default());
    store
        .put(
            TAXONOMY_KEY,
            br#"{"29-1141.00": "Registered Nurses", "15-1132.00": "Software Developers, Applications"}"#
                .to_vec(),
        )
        .await
        .expect("put taxonomy");

    let registry = PartnerRegistry::from_yaml_str(&format!(
        "partners:\n  - partner_id: P1\n    source: fixture\n    options:\n      fixtures_dir: {dir}\n      occupation_code_field: onet_soc_code\n  - partner_id: P2\n    source: fixture\n    options:\n      fixtures_dir: {dir}\n      occupation_code_field: onet_soc_code\n",
        dir = fixtures.display()
    ))
    .expect("registry");
    let workflow = Workflow::new(config(dir.path(), 2), registry, store.clone());

    workflow.run(date(2013, 5, 1)).await.expect("2013Q2 run");
    let after_first_year = workflow.run(date(2013, 8, 1)).await.expect("2013Q3 run");
    let baseline = after_first_year.global.clone();
    assert_eq!(baseline.total, 14);
    assert_eq!(baseline.partners.len(), 2);
    assert_eq!(baseline.quarters.get(&quarter("2013Q2")), Some(&7));
    assert_eq!(baseline.quarters.get(&quarter("2013Q3")), Some(&7));
    assert_eq!(baseline.field_presence.get("occupation_title"), Some(&14));

    // Re-running an already processed quarter changes nothing.
    let rerun = workflow.run(date(2013, 5, 1)).await.expect("2013Q2 rerun");
    assert_eq!(rerun.global, baseline);
    assert_eq!(
        store.list("prefix/2013Q2/P1_").await.expect("list").len(),
        2,
        "4 postings at 2 per file"
    );

    write_fixture(&fixtures, "P1", "2014Q2", 1);
    write_fixture(&fixtures, "P2", "2014Q2", 2);
    let later = workflow.run(date(2014, 5, 1)).await.expect("2014Q2 run");

    assert_eq!(later.global.partners.len(), 2);
    assert_eq!(later.global.total, 17);
    let earlier: BTreeMap<_, _> = later
        .global
        .quarters
        .iter()
        .filter(|(q, _)| q.year() == 2013)
        .map(|(q, n)| (*q, *n))
        .collect();
    assert_eq!(earlier, baseline.quarters);
    assert_eq!(later.global.quarters.get(&quarter("2014Q2")), Some(&3));

    let p1 = later
        .partner_summaries
        .iter()
        .find(|s| s.dataset_id.as_str() == "P1")
        .expect("P1 summary");
    assert_eq!(p1.quarters.len(), 3);
    assert_eq!(p1.total, 7);

    assert_eq!(
        store.taxonomy_gets.load(Ordering::SeqCst),
        1,
        "taxonomy is fetched once across quarters"
    );
}
