//! Feedback / reinforcement store.
//!
//! [`FeedbackStore`] is the persistence capability (append + query by
//! context signature); [`FeedbackService`] layers fire-and-forget recording,
//! time-decayed scoring, score tables and rollups on top of any store.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use pipewright_types::{
    duration_serde, ContextSignature, FeedbackOutcome, FeedbackRecord, Result,
};

/// Score reported for a template with no recorded history.
pub const NEUTRAL_SCORE: f64 = 0.5;

// ---------------------------------------------------------------------------
// FeedbackStore capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Append one record. Records are never rewritten.
    async fn record(&self, record: FeedbackRecord) -> Result<()>;

    /// Every record for `signature`, oldest first.
    async fn records_for(&self, signature: &ContextSignature) -> Result<Vec<FeedbackRecord>>;

    /// Every record in the store, oldest first.
    async fn all_records(&self) -> Result<Vec<FeedbackRecord>>;
}

/// Process-local store; history is lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryFeedbackStore {
    records: RwLock<Vec<FeedbackRecord>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn record(&self, record: FeedbackRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn records_for(&self, signature: &ContextSignature) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| &r.signature == signature)
            .cloned()
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<FeedbackRecord>> {
        Ok(self.records.read().await.clone())
    }
}

/// Append-only JSON-lines file: one [`FeedbackRecord`] per line.
///
/// Appends are serialised through a mutex so concurrent writers never
/// interleave partial lines. Lines that fail to parse are skipped on read.
#[derive(Debug)]
pub struct JsonlFeedbackStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlFeedbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<FeedbackRecord>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedbackRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable feedback record"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl FeedbackStore for JsonlFeedbackStore {
    async fn record(&self, record: FeedbackRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn records_for(&self, signature: &ContextSignature) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| &r.signature == signature)
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<FeedbackRecord>> {
        self.read_all().await
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Parameters of the time-decayed success rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Age at which a record counts half as much as a fresh one.
    #[serde(with = "duration_serde")]
    pub half_life: Duration,
    /// Credit given to a success that needed repairs, in `[0, 1]`.
    pub repair_success_weight: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(30 * 86_400),
            repair_success_weight: 1.0,
        }
    }
}

impl ScoringPolicy {
    fn outcome_value(&self, outcome: FeedbackOutcome) -> f64 {
        match outcome {
            FeedbackOutcome::SucceededFirstTry => 1.0,
            FeedbackOutcome::SucceededAfterRepair => self.repair_success_weight.clamp(0.0, 1.0),
            FeedbackOutcome::Failed => 0.0,
        }
    }

    fn decay(&self, recorded_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age = (now - recorded_at).num_milliseconds().max(0) as f64;
        let half_life = self.half_life.as_millis().max(1) as f64;
        0.5f64.powf(age / half_life)
    }
}

/// Time-decayed success rate of `template_id` over `records`, in `[0, 1]`.
///
/// Exactly [`NEUTRAL_SCORE`] when no record mentions the template.
pub fn score_records(
    records: &[FeedbackRecord],
    template_id: &str,
    policy: &ScoringPolicy,
    now: DateTime<Utc>,
) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for record in records.iter().filter(|r| r.uses_template(template_id)) {
        let w = policy.decay(record.recorded_at, now);
        weighted += w * policy.outcome_value(record.outcome);
        total += w;
    }
    if total <= f64::EPSILON {
        return NEUTRAL_SCORE;
    }
    (weighted / total).clamp(0.0, 1.0)
}

/// One row of a per-template score table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateScore {
    pub template_id: String,
    pub score: f64,
    pub samples: usize,
}

/// Per-(signature, template) summary of recorded outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRollup {
    pub signature: ContextSignature,
    pub template_id: String,
    pub succeeded_first_try: usize,
    pub succeeded_after_repair: usize,
    pub failed: usize,
    pub mean_attempts: f64,
}

impl FeedbackRollup {
    pub fn total(&self) -> usize {
        self.succeeded_first_try + self.succeeded_after_repair + self.failed
    }
}

/// Fold `records` into rollups keyed by (signature, template), sorted by key.
pub fn rollup_records(records: &[FeedbackRecord]) -> Vec<FeedbackRollup> {
    let mut groups: BTreeMap<(String, String), (FeedbackRollup, usize)> = BTreeMap::new();
    for record in records {
        for template_id in &record.template_ids {
            let key = (record.signature.as_str().to_string(), template_id.clone());
            let (rollup, attempts) = groups.entry(key).or_insert_with(|| {
                (
                    FeedbackRollup {
                        signature: record.signature.clone(),
                        template_id: template_id.clone(),
                        succeeded_first_try: 0,
                        succeeded_after_repair: 0,
                        failed: 0,
                        mean_attempts: 0.0,
                    },
                    0,
                )
            });
            match record.outcome {
                FeedbackOutcome::SucceededFirstTry => rollup.succeeded_first_try += 1,
                FeedbackOutcome::SucceededAfterRepair => rollup.succeeded_after_repair += 1,
                FeedbackOutcome::Failed => rollup.failed += 1,
            }
            *attempts += record.attempt_count;
        }
    }
    groups
        .into_values()
        .map(|(mut rollup, attempts)| {
            rollup.mean_attempts = attempts as f64 / rollup.total().max(1) as f64;
            rollup
        })
        .collect()
}

// ---------------------------------------------------------------------------
// FeedbackService
// ---------------------------------------------------------------------------

/// Shared handle over a [`FeedbackStore`]: cheap to clone, safe to use from
/// any number of concurrent requests.
#[derive(Clone)]
pub struct FeedbackService {
    store: Arc<dyn FeedbackStore>,
    policy: ScoringPolicy,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FeedbackService {
    pub fn new(store: Arc<dyn FeedbackStore>, policy: ScoringPolicy) -> Self {
        Self {
            store,
            policy,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryFeedbackStore::new()), ScoringPolicy::default())
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn FeedbackStore> {
        &self.store
    }

    /// Append `record` in the background. Store failures are logged and
    /// swallowed; the caller never waits on persistence.
    pub fn record(&self, record: FeedbackRecord) {
        let store = self.store.clone();
        let handle = tokio::spawn(async move {
            let request_id = record.request_id.clone();
            if let Err(e) = store.record(record).await {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to record feedback");
            }
        });
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every background append started so far.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Feedback append task did not complete");
            }
        }
    }

    /// Score of `template_id` for `signature`; neutral when the store fails.
    pub async fn score(&self, signature: &ContextSignature, template_id: &str) -> f64 {
        match self.store.records_for(signature).await {
            Ok(records) => score_records(&records, template_id, &self.policy, Utc::now()),
            Err(e) => {
                tracing::warn!(signature = %signature, error = %e, "Feedback query failed; using neutral score");
                NEUTRAL_SCORE
            }
        }
    }

    /// Scores for each of `template_ids` from one store query.
    pub async fn scores_for(
        &self,
        signature: &ContextSignature,
        template_ids: &[&str],
    ) -> HashMap<String, f64> {
        let records = match self.store.records_for(signature).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(signature = %signature, error = %e, "Feedback query failed; using neutral scores");
                Vec::new()
            }
        };
        let now = Utc::now();
        template_ids
            .iter()
            .map(|id| (id.to_string(), score_records(&records, id, &self.policy, now)))
            .collect()
    }

    /// Per-template score table for every template with history under
    /// `signature`, best first.
    pub async fn score_table(&self, signature: &ContextSignature) -> Result<Vec<TemplateScore>> {
        let records = self.store.records_for(signature).await?;
        let now = Utc::now();
        let mut samples: BTreeMap<&str, usize> = BTreeMap::new();
        for record in &records {
            for id in &record.template_ids {
                *samples.entry(id.as_str()).or_default() += 1;
            }
        }
        let mut table: Vec<TemplateScore> = samples
            .into_iter()
            .map(|(id, n)| TemplateScore {
                template_id: id.to_string(),
                score: score_records(&records, id, &self.policy, now),
                samples: n,
            })
            .collect();
        table.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.template_id.cmp(&b.template_id))
        });
        Ok(table)
    }

    /// Rollups for one signature, or for the whole store when `None`.
    pub async fn rollup(&self, signature: Option<&ContextSignature>) -> Result<Vec<FeedbackRollup>> {
        let records = match signature {
            Some(sig) => self.store.records_for(sig).await?,
            None => self.store.all_records().await?,
        };
        Ok(rollup_records(&records))
    }
}

impl std::fmt::Debug for FeedbackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
