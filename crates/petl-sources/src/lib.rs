//! Partner posting source contracts + fixture-first source implementations.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use petl_core::{PartnerId, Posting, Quarter};
use petl_storage::{BlobStore, OccupationTaxonomy, ReferenceCache, StorageError};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "petl-sources";

/// Source-specific options handed through from the partner registry untouched.
pub type PassthroughOptions = Map<String, Value>;

/// Lazy posting sequence for one partner-quarter.
pub type PostingStream = BoxStream<'static, Result<Posting, SourceError>>;

pub const OCCUPATION_TITLE_FIELD: &str = "occupation_title";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source kind `{0}`; expected one of: {kinds}", kinds = SOURCE_KINDS.join(", "))]
    UnknownKind(String),
    #[error("invalid options for `{kind}` source: {source}")]
    Options {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{location}: record {record}: {message}")]
    Malformed {
        location: String,
        record: usize,
        message: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Shared collaborators every source is built with.
#[derive(Clone)]
pub struct SourceContext {
    pub store: Arc<dyn BlobStore>,
    pub partner_id: PartnerId,
    pub reference_cache: Arc<ReferenceCache>,
}

#[async_trait]
pub trait PostingSource: Send + Sync {
    fn kind(&self) -> &'static str;
    fn partner_id(&self) -> &PartnerId;

    async fn postings(&self, quarter: Quarter) -> Result<PostingStream, SourceError>;
}

fn parse_options<T: DeserializeOwned>(
    kind: &'static str,
    options: &PassthroughOptions,
) -> Result<T, SourceError> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|source| SourceError::Options { kind, source })
}

fn to_posting(location: &str, record: usize, value: Value) -> Result<Posting, SourceError> {
    Posting::try_from(value).map_err(|err| SourceError::Malformed {
        location: location.to_string(),
        record,
        message: err.to_string(),
    })
}

/// Parse newline-delimited JSON; blank lines are skipped, records are numbered from 1.
pub fn parse_ndjson(location: &str, bytes: &[u8]) -> Vec<Result<Posting, SourceError>> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            return vec![Err(SourceError::Malformed {
                location: location.to_string(),
                record: 0,
                message: format!("not utf-8: {err}"),
            })]
        }
    };

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let value: Value =
                serde_json::from_str(line).map_err(|err| SourceError::Malformed {
                    location: location.to_string(),
                    record: idx + 1,
                    message: err.to_string(),
                })?;
            to_posting(location, idx + 1, value)
        })
        .collect()
}

/// Adds an occupation title to postings whose code field is known to the taxonomy.
#[derive(Clone)]
struct OccupationAnnotator {
    code_field: String,
    taxonomy: Arc<OccupationTaxonomy>,
}

impl OccupationAnnotator {
    async fn load(
        code_field: Option<&str>,
        cache: &ReferenceCache,
    ) -> Result<Option<Self>, SourceError> {
        let Some(code_field) = code_field else {
            return Ok(None);
        };
        let taxonomy = cache.taxonomy().await?;
        Ok(Some(Self {
            code_field: code_field.to_string(),
            taxonomy,
        }))
    }

    fn annotate(&self, mut posting: Posting) -> Posting {
        let title = posting
            .get(&self.code_field)
            .and_then(Value::as_str)
            .and_then(|code| self.taxonomy.title_for(code))
            .map(str::to_string);
        if let Some(title) = title {
            posting.insert(OCCUPATION_TITLE_FIELD, Value::String(title));
        }
        posting
    }
}

fn annotated(stream: PostingStream, annotator: Option<OccupationAnnotator>) -> PostingStream {
    match annotator {
        Some(annotator) => stream
            .map(move |result| result.map(|posting| annotator.annotate(posting)))
            .boxed(),
        None => stream,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureOptions {
    fixtures_dir: PathBuf,
    #[serde(default)]
    occupation_code_field: Option<String>,
}

/// Reads `{fixtures_dir}/{partner_id}/{quarter}.json`, a JSON array of posting objects.
pub struct FixtureSource {
    ctx: SourceContext,
    options: FixtureOptions,
}

impl FixtureSource {
    pub const KIND: &'static str = "fixture";

    pub fn new(ctx: SourceContext, options: &PassthroughOptions) -> Result<Self, SourceError> {
        Ok(Self {
            ctx,
            options: parse_options(Self::KIND, options)?,
        })
    }

    pub fn fixture_path(&self, quarter: Quarter) -> PathBuf {
        self.options
            .fixtures_dir
            .join(self.ctx.partner_id.as_str())
            .join(format!("{quarter}.json"))
    }
}

#[async_trait]
impl PostingSource for FixtureSource {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn partner_id(&self) -> &PartnerId {
        &self.ctx.partner_id
    }

    async fn postings(&self, quarter: Quarter) -> Result<PostingStream, SourceError> {
        let path = self.fixture_path(quarter);
        let location = path.display().to_string();
        let present = fs::try_exists(&path)
            .await
            .map_err(|err| anyhow::Error::new(err).context(format!("checking {location}")))?;
        if !present {
            debug!(path = %path.display(), "no fixture for quarter");
            return Ok(stream::empty().boxed());
        }

        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| anyhow::Error::new(err).context(format!("reading {location}")))?;
        let values: Vec<Value> =
            serde_json::from_str(&text).map_err(|err| SourceError::Malformed {
                location: location.clone(),
                record: 0,
                message: err.to_string(),
            })?;
        let postings = values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| to_posting(&location, idx + 1, value))
            .collect::<Vec<_>>();

        let annotator = OccupationAnnotator::load(
            self.options.occupation_code_field.as_deref(),
            &self.ctx.reference_cache,
        )
        .await?;
        Ok(annotated(stream::iter(postings).boxed(), annotator))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawNdjsonOptions {
    raw_prefix: String,
    #[serde(default)]
    occupation_code_field: Option<String>,
}

/// Streams raw partner dumps stored as NDJSON blobs under `{raw_prefix}/{quarter}/`,
/// one blob at a time.
pub struct RawNdjsonSource {
    ctx: SourceContext,
    options: RawNdjsonOptions,
}

impl RawNdjsonSource {
    pub const KIND: &'static str = "raw-ndjson";

    pub fn new(ctx: SourceContext, options: &PassthroughOptions) -> Result<Self, SourceError> {
        Ok(Self {
            ctx,
            options: parse_options(Self::KIND, options)?,
        })
    }

    pub fn quarter_prefix(&self, quarter: Quarter) -> String {
        format!("{}/{quarter}/", self.options.raw_prefix.trim_end_matches('/'))
    }
}

#[async_trait]
impl PostingSource for RawNdjsonSource {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn partner_id(&self) -> &PartnerId {
        &self.ctx.partner_id
    }

    async fn postings(&self, quarter: Quarter) -> Result<PostingStream, SourceError> {
        let keys = self.ctx.store.list(&self.quarter_prefix(quarter)).await?;
        debug!(raw_files = keys.len(), %quarter, "listed raw partner files");

        let store = self.ctx.store.clone();
        let postings = stream::iter(keys)
            .then(move |key| {
                let store = store.clone();
                async move {
                    match store.get(&key).await {
                        Ok(bytes) => parse_ndjson(&key, &bytes),
                        Err(err) => vec![Err(SourceError::from(err))],
                    }
                }
            })
            .flat_map(stream::iter)
            .boxed();

        let annotator = OccupationAnnotator::load(
            self.options.occupation_code_field.as_deref(),
            &self.ctx.reference_cache,
        )
        .await?;
        Ok(annotated(postings, annotator))
    }
}

pub const SOURCE_KINDS: &[&str] = &[FixtureSource::KIND, RawNdjsonSource::KIND];

pub fn source_for_kind(
    kind: &str,
    ctx: SourceContext,
    options: &PassthroughOptions,
) -> Result<Box<dyn PostingSource>, SourceError> {
    match kind {
        FixtureSource::KIND => Ok(Box::new(FixtureSource::new(ctx, options)?)),
        RawNdjsonSource::KIND => Ok(Box::new(RawNdjsonSource::new(ctx, options)?)),
        other => Err(SourceError::UnknownKind(other.to_string())),
    }
}
