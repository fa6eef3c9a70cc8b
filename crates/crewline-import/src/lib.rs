//! Duplicate detection and import orchestration for bulk uploads.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use crewline_core::{
    display_row, CanonicalRecord, DuplicateGroup, EntityType, ImportJob, ImportJobStatus,
    ImportSummary, InsertError, MatchField, RawRow, Recommendation, RowError, SimilarityWeights,
    APPROVAL_ROW_THRESHOLD, INSERT_BATCH_SIZE, RESPONSE_ERROR_SAMPLE, STORED_ERROR_CAP,
};
use crewline_mapping::{map_and_validate, resolve_entity, MappingError};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crewline-import";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for duplicate detection. The cutoffs are heuristics inherited
/// from production data, kept configurable rather than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct DedupeConfig {
    pub weights: SimilarityWeights,
    /// Pairs scoring at or above this join a group.
    pub threshold: f64,
    /// Above this, an exact email match is decisive enough to keep the first.
    pub keep_first_cutoff: f64,
    /// Above this, three matching field groups justify an automatic merge.
    pub merge_cutoff: f64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            weights: SimilarityWeights::default(),
            threshold: 0.85,
            keep_first_cutoff: 0.95,
            merge_cutoff: 0.9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DedupeRulesFile {
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    keep_first_cutoff: Option<f64>,
    #[serde(default)]
    merge_cutoff: Option<f64>,
    #[serde(default)]
    weights: Option<WeightOverrides>,
}

#[derive(Debug, Clone, Deserialize)]
struct WeightOverrides {
    #[serde(default)]
    email: Option<f64>,
    #[serde(default)]
    phone: Option<f64>,
    #[serde(default)]
    name: Option<f64>,
    #[serde(default)]
    address: Option<f64>,
    #[serde(default)]
    city_zip: Option<f64>,
}

impl DedupeConfig {
    /// Loads partial overrides from a YAML tuning file on top of defaults.
    pub fn from_rules_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: DedupeRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut config = Self::default();
        if let Some(v) = rules.threshold {
            config.threshold = v;
        }
        if let Some(v) = rules.keep_first_cutoff {
            config.keep_first_cutoff = v;
        }
        if let Some(v) = rules.merge_cutoff {
            config.merge_cutoff = v;
        }
        if let Some(weights) = rules.weights {
            if let Some(v) = weights.email {
                config.weights.email = v;
            }
            if let Some(v) = weights.phone {
                config.weights.phone = v;
            }
            if let Some(v) = weights.name {
                config.weights.name = v;
            }
            if let Some(v) = weights.address {
                config.weights.address = v;
            }
            if let Some(v) = weights.city_zip {
                config.weights.city_zip = v;
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub batch_size: usize,
    pub approval_threshold: usize,
    pub dedupe: DedupeConfig,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: INSERT_BATCH_SIZE,
            approval_threshold: APPROVAL_ROW_THRESHOLD,
            dedupe: DedupeConfig::default(),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = std::env::var("CREWLINE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.batch_size = n;
        }
        if let Some(n) = std::env::var("CREWLINE_APPROVAL_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.approval_threshold = n;
        }
        if let Ok(path) = std::env::var("CREWLINE_DEDUPE_RULES") {
            match DedupeConfig::from_rules_file(Path::new(&path)) {
                Ok(dedupe) => config.dedupe = dedupe,
                Err(err) => warn!(error = %err, path = %path, "ignoring unreadable dedupe rules file"),
            }
        }
        config.batch_size = config.batch_size.max(1);
        config
    }
}

// ---------------------------------------------------------------------------
// Field normalization and pairwise similarity
// ---------------------------------------------------------------------------

const ADDRESS_ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("road", "rd"),
    ("drive", "dr"),
    ("boulevard", "blvd"),
    ("apartment", "apt"),
    ("suite", "ste"),
];

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Strips formatting and a leading US country code from a phone number.
pub fn normalize_phone(raw: &str) -> String {
    let digits = raw
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    }
}

/// Lower-cases an address, shortens common street words, and drops everything
/// that is not alphanumeric, so "123 Main Street" and "123 main st." agree.
pub fn normalize_address(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .map(|word| {
            let token = word
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .collect::<String>();
            match ADDRESS_ABBREVIATIONS.iter().find(|(long, _)| *long == token) {
                Some((_, short)) => short.to_string(),
                None => token,
            }
        })
        .collect::<String>()
}

/// Normalized edit-distance similarity in `[0, 1]`; empty strings never match.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    1.0 - strsim::levenshtein(a, b) as f64 / max_len as f64
}

fn phone_factor(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.len() >= 10 && b.len() >= 10 && a[a.len() - 10..] == b[b.len() - 10..] {
        return 0.9;
    }
    0.0
}

fn zip_prefix(zip: &str) -> String {
    zip.chars().filter(char::is_ascii_digit).take(5).collect()
}

/// Picks the best comparable name pair: composed first/last when both records
/// carry one, else display names, else company names.
fn compared_names(a: &CanonicalRecord, b: &CanonicalRecord) -> Option<(String, String)> {
    let composed = |r: &CanonicalRecord| {
        r.get("first_name").map(|first| {
            let last = r.get("last_name").unwrap_or_default();
            format!("{first} {last}").trim().to_string()
        })
    };
    let pair = match (composed(a), composed(b)) {
        (Some(na), Some(nb)) => Some((na, nb)),
        _ => match (a.get("display_name"), b.get("display_name")) {
            (Some(na), Some(nb)) => Some((na.to_string(), nb.to_string())),
            _ => match (a.get("company_name"), b.get("company_name")) {
                (Some(na), Some(nb)) => Some((na.to_string(), nb.to_string())),
                _ => None,
            },
        },
    };
    pair.filter(|(na, nb)| !na.is_empty() && !nb.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairScore {
    pub similarity: f64,
    pub matching: BTreeSet<MatchField>,
}

/// Weighted similarity for one record pair. The denominator only accumulates
/// weights of field groups present on both records, so a pair sharing no
/// comparable group scores zero.
pub fn pair_similarity(
    a: &CanonicalRecord,
    b: &CanonicalRecord,
    weights: &SimilarityWeights,
) -> PairScore {
    let mut score = 0.0;
    let mut max_score = 0.0;
    let mut matching = BTreeSet::new();

    if let (Some(ea), Some(eb)) = (a.get("email"), b.get("email")) {
        max_score += weights.email;
        if normalize_email(ea) == normalize_email(eb) {
            score += weights.email;
            matching.insert(MatchField::Email);
        }
    }

    if let (Some(pa), Some(pb)) = (a.get("phone"), b.get("phone")) {
        let na = normalize_phone(pa);
        let nb = normalize_phone(pb);
        if !na.is_empty() && !nb.is_empty() {
            max_score += weights.phone;
            let factor = phone_factor(&na, &nb);
            score += factor * weights.phone;
            if factor >= 0.9 {
                matching.insert(MatchField::Phone);
            }
        }
    }

    if let Some((na, nb)) = compared_names(a, b) {
        max_score += weights.name;
        let similarity = string_similarity(&na, &nb);
        score += similarity * weights.name;
        if similarity > 0.9 {
            matching.insert(MatchField::Name);
        }
    }

    if let (Some(aa), Some(ab)) = (a.get("address"), b.get("address")) {
        let na = normalize_address(aa);
        let nb = normalize_address(ab);
        if !na.is_empty() && !nb.is_empty() {
            max_score += weights.address;
            let similarity = string_similarity(&na, &nb);
            score += similarity * weights.address;
            if similarity > 0.8 {
                matching.insert(MatchField::Address);
            }
        }
    }

    if let (Some(ca), Some(za), Some(cb), Some(zb)) =
        (a.get("city"), a.get("zip"), b.get("city"), b.get("zip"))
    {
        max_score += weights.city_zip;
        let zip_a = zip_prefix(za);
        if ca.trim().eq_ignore_ascii_case(cb.trim()) && !zip_a.is_empty() && zip_a == zip_prefix(zb)
        {
            score += weights.city_zip;
            matching.insert(MatchField::CityZip);
        }
    }

    let similarity = if max_score > 0.0 { score / max_score } else { 0.0 };
    PairScore {
        similarity,
        matching,
    }
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) -> usize {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent[root_b] = root_a;
        }
        root_a
    }
}

#[derive(Debug, Default, Clone)]
struct GroupAccum {
    sum: f64,
    merges: usize,
    matching: BTreeSet<MatchField>,
}

fn group_key(members: &BTreeSet<usize>) -> Uuid {
    let joined = members
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("-");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, joined.as_bytes())
}

fn recommend(
    similarity: f64,
    matching: &BTreeSet<MatchField>,
    config: &DedupeConfig,
) -> Recommendation {
    if similarity > config.keep_first_cutoff && matching.contains(&MatchField::Email) {
        Recommendation::KeepFirst
    } else if similarity > config.merge_cutoff && matching.len() >= 3 {
        Recommendation::Merge
    } else if similarity > config.threshold && similarity <= config.merge_cutoff {
        Recommendation::Review
    } else {
        Recommendation::KeepFirst
    }
}

fn first_member(group: &DuplicateGroup) -> usize {
    group
        .record_indices
        .iter()
        .next()
        .copied()
        .unwrap_or(usize::MAX)
}

/// Clusters probable duplicates over every unordered record pair.
///
/// Qualifying pairs (similarity at or above the threshold, inclusive) are
/// merged through a disjoint-set keyed by record index, so membership is the
/// transitive closure of the pair relation. Group similarity is the running
/// average of the pair scores that caused merges. Output is sorted by
/// descending similarity and fully deterministic for a fixed input order.
pub fn detect_duplicates(records: &[CanonicalRecord], config: &DedupeConfig) -> Vec<DuplicateGroup> {
    let mut sets = DisjointSet::new(records.len());
    let mut accums: HashMap<usize, GroupAccum> = HashMap::new();

    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            let pair = pair_similarity(&records[i], &records[j], &config.weights);
            if pair.similarity < config.threshold {
                continue;
            }
            let root_i = sets.find(i);
            let root_j = sets.find(j);
            let mut accum = accums.remove(&root_i).unwrap_or_default();
            if root_j != root_i {
                if let Some(absorbed) = accums.remove(&root_j) {
                    accum.sum += absorbed.sum;
                    accum.merges += absorbed.merges;
                    accum.matching.extend(absorbed.matching);
                }
            }
            accum.sum += pair.similarity;
            accum.merges += 1;
            accum.matching.extend(pair.matching.iter().copied());
            let root = sets.union(i, j);
            accums.insert(root, accum);
        }
    }

    let mut members: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for index in 0..records.len() {
        let root = sets.find(index);
        if accums.contains_key(&root) {
            members.entry(root).or_default().insert(index);
        }
    }

    let mut groups = members
        .into_iter()
        .map(|(root, record_indices)| {
            let accum = &accums[&root];
            let similarity = accum.sum / accum.merges as f64;
            DuplicateGroup {
                key: group_key(&record_indices),
                similarity,
                matching_fields: accum.matching.clone(),
                recommendation: recommend(similarity, &accum.matching, config),
                record_indices,
            }
        })
        .collect::<Vec<_>>();

    groups.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| first_member(a).cmp(&first_member(b)))
    });
    groups
}

// ---------------------------------------------------------------------------
// Datastore seams
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// What the datastore reports after an insert attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOutcome {
    /// Rows written, when the datastore says; callers fall back to batch size.
    pub inserted: Option<usize>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_batch(
        &self,
        entity: EntityType,
        records: &[CanonicalRecord],
    ) -> Result<InsertOutcome, StoreError>;

    /// Stored records for the tenant, used only for advisory duplicate checks.
    async fn existing_records(
        &self,
        entity: EntityType,
        company_id: &str,
    ) -> Result<Vec<CanonicalRecord>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &ImportJob) -> Result<(), StoreError>;
    async fn load_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError>;
    async fn update_job(&self, job: &ImportJob) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("file contains no data rows")]
    EmptyFile,
    #[error("import job {0} not found")]
    JobNotFound(Uuid),
    #[error("import job {id} is {status}, not awaiting approval")]
    NotAwaitingApproval { id: Uuid, status: ImportJobStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One upload, already parsed into header-keyed rows by the caller.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub rows: Vec<RawRow>,
    pub headers: Vec<String>,
    pub data_type: String,
    pub dry_run: bool,
    pub file_name: String,
    pub company_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
struct BatchResult {
    batch: usize,
    outcome: Result<usize, String>,
}

#[derive(Debug, Default, Clone)]
struct CommitStats {
    processed_rows: usize,
    insert_errors: Vec<InsertError>,
}

fn fold_batches(results: Vec<BatchResult>) -> CommitStats {
    results
        .into_iter()
        .fold(CommitStats::default(), |mut stats, result| {
            match result.outcome {
                Ok(inserted) => stats.processed_rows += inserted,
                Err(message) => stats.insert_errors.push(InsertError {
                    batch: result.batch,
                    message,
                }),
            }
            stats
        })
}

fn completion_message(valid_rows: usize, stats: &CommitStats) -> String {
    if stats.insert_errors.is_empty() {
        format!(
            "Imported {} of {} valid rows",
            stats.processed_rows, valid_rows
        )
    } else {
        format!(
            "Imported {} of {} valid rows; {} batches failed",
            stats.processed_rows,
            valid_rows,
            stats.insert_errors.len()
        )
    }
}

/// Owns the import job lifecycle: validation statistics, the dry-run and
/// approval gates, batched commits with per-batch failure isolation, and the
/// single finalizing write of job status.
pub struct ImportPipeline {
    config: ImportConfig,
    records: Arc<dyn RecordStore>,
    jobs: Arc<dyn JobStore>,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig, records: Arc<dyn RecordStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            records,
            jobs,
        }
    }

    /// Runs one upload end to end and returns the uploader-facing summary.
    ///
    /// Row and batch failures are aggregated, never raised; only structural
    /// problems and job-persistence failures surface as errors.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportSummary, ImportError> {
        let entity = resolve_entity(&request.data_type)?;
        if request.rows.is_empty() {
            return Err(ImportError::EmptyFile);
        }

        let total_rows = request.rows.len();
        let mut valid_records = Vec::new();
        let mut row_errors = Vec::new();
        for (index, row) in request.rows.iter().enumerate() {
            let mapped = map_and_validate(row, entity, &request.company_id);
            if mapped.valid {
                valid_records.push(mapped.record);
            } else {
                row_errors.push(RowError {
                    row: display_row(index),
                    messages: mapped.errors,
                });
            }
        }
        let valid_rows = valid_records.len();
        let error_rows = row_errors.len();

        let duplicate_groups = self
            .advisory_duplicate_count(entity, &request.company_id, &valid_records)
            .await;

        let status = if request.dry_run {
            ImportJobStatus::DryRun
        } else if total_rows > self.config.approval_threshold {
            ImportJobStatus::Pending
        } else {
            ImportJobStatus::Processing
        };
        let now = Utc::now();
        let mut job = ImportJob {
            id: Uuid::new_v4(),
            company_id: request.company_id.clone(),
            user_id: request.user_id.clone(),
            data_type: entity,
            status,
            file_name: request.file_name.clone(),
            total_rows,
            valid_rows,
            error_rows,
            dry_run: request.dry_run,
            requires_approval: status == ImportJobStatus::Pending,
            validation_errors: row_errors.iter().take(STORED_ERROR_CAP).cloned().collect(),
            headers_found: request.headers.clone(),
            processed_rows: 0,
            insert_errors: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.jobs.create_job(&job).await?;
        info!(
            job_id = %job.id,
            status = %job.status,
            total_rows,
            valid_rows,
            "import job created"
        );

        let message = match job.status {
            ImportJobStatus::DryRun => {
                format!("Dry run complete: {valid_rows} of {total_rows} rows valid")
            }
            ImportJobStatus::Pending => {
                format!("Import of {total_rows} rows is awaiting approval; nothing was committed")
            }
            _ => {
                let stats = self.commit_and_finalize(&mut job, &valid_records).await?;
                completion_message(valid_rows, &stats)
            }
        };

        Ok(self.summarize(&job, duplicate_groups, message))
    }

    /// Commit path invoked by the approval action for a job held as pending.
    ///
    /// The caller supplies the originally uploaded rows; mapping is pure, so
    /// re-validation reproduces exactly the records the job was created from.
    pub async fn commit_approved(
        &self,
        job_id: Uuid,
        rows: &[RawRow],
    ) -> Result<ImportSummary, ImportError> {
        let mut job = self
            .jobs
            .load_job(job_id)
            .await?
            .ok_or(ImportError::JobNotFound(job_id))?;
        if job.status != ImportJobStatus::Pending {
            return Err(ImportError::NotAwaitingApproval {
                id: job_id,
                status: job.status,
            });
        }

        let entity = job.data_type;
        let mut valid_records = Vec::new();
        for row in rows {
            let mapped = map_and_validate(row, entity, &job.company_id);
            if mapped.valid {
                valid_records.push(mapped.record);
            }
        }

        if !job.transition(ImportJobStatus::Processing) {
            warn!(job_id = %job.id, status = %job.status, "refusing illegal status transition");
        }
        self.jobs.update_job(&job).await?;
        info!(job_id = %job.id, rows = valid_records.len(), "approved import moved to processing");

        let duplicate_groups = self
            .advisory_duplicate_count(entity, &job.company_id, &valid_records)
            .await;
        let stats = self.commit_and_finalize(&mut job, &valid_records).await?;
        let message = completion_message(job.valid_rows, &stats);
        Ok(self.summarize(&job, duplicate_groups, message))
    }

    /// Advisory only: a failure to read stored records degrades to checking
    /// the upload against itself and never blocks the import.
    async fn advisory_duplicate_count(
        &self,
        entity: EntityType,
        company_id: &str,
        new_records: &[CanonicalRecord],
    ) -> usize {
        let existing = match self.records.existing_records(entity, company_id).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "skipping duplicate check against stored records");
                Vec::new()
            }
        };
        let mut candidates = new_records.to_vec();
        candidates.extend(existing);
        let groups = detect_duplicates(&candidates, &self.config.dedupe);

        let new_count = new_records.len();
        let relevant = groups
            .iter()
            .filter(|group| group.record_indices.iter().any(|&index| index < new_count))
            .count();
        if relevant > 0 {
            info!(groups = relevant, "probable duplicates detected");
        }
        relevant
    }

    async fn commit_and_finalize(
        &self,
        job: &mut ImportJob,
        records: &[CanonicalRecord],
    ) -> Result<CommitStats, ImportError> {
        let results = self.commit_batches(job.data_type, records).await;
        let stats = fold_batches(results);

        let next = if stats.insert_errors.is_empty() {
            ImportJobStatus::Completed
        } else {
            ImportJobStatus::CompletedWithErrors
        };
        job.processed_rows = stats.processed_rows;
        job.insert_errors = stats
            .insert_errors
            .iter()
            .take(STORED_ERROR_CAP)
            .cloned()
            .collect();
        if !job.transition(next) {
            warn!(job_id = %job.id, status = %job.status, "refusing illegal status transition");
        }
        self.jobs.update_job(job).await?;
        info!(
            job_id = %job.id,
            status = %job.status,
            processed_rows = job.processed_rows,
            insert_errors = job.insert_errors.len(),
            "import job finalized"
        );
        Ok(stats)
    }

    /// Batches run strictly in order and independently: one failing batch is
    /// recorded and the next still commits.
    async fn commit_batches(
        &self,
        entity: EntityType,
        records: &[CanonicalRecord],
    ) -> Vec<BatchResult> {
        let mut results = Vec::new();
        for (index, chunk) in records.chunks(self.config.batch_size.max(1)).enumerate() {
            let batch = index + 1;
            let outcome = match self.records.insert_batch(entity, chunk).await {
                Ok(outcome) => Ok(outcome.inserted.unwrap_or(chunk.len())),
                Err(err) => {
                    warn!(batch, error = %err, "insert batch failed; continuing with next batch");
                    Err(err.to_string())
                }
            };
            results.push(BatchResult { batch, outcome });
        }
        results
    }

    fn summarize(
        &self,
        job: &ImportJob,
        duplicate_groups: usize,
        message: String,
    ) -> ImportSummary {
        ImportSummary {
            job_id: job.id,
            total_rows: job.total_rows,
            valid_rows: job.valid_rows,
            error_rows: job.error_rows,
            duplicate_groups,
            requires_approval: job.requires_approval,
            dry_run: job.dry_run,
            validation_errors: job
                .validation_errors
                .iter()
                .take(RESPONSE_ERROR_SAMPLE)
                .cloned()
                .collect(),
            headers_found: job.headers_found.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    fn record(entity: EntityType, pairs: &[(&str, &str)]) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(entity);
        for (field, value) in pairs {
            record.set(*field, *value);
        }
        record
    }

    fn customer(pairs: &[(&str, &str)]) -> CanonicalRecord {
        record(EntityType::Customer, pairs)
    }

    #[test]
    fn phone_normalization_strips_formatting_and_country_code() {
        assert_eq!(normalize_phone("1 (512) 555-0100"), "5125550100");
        assert_eq!(normalize_phone("512-555-0100"), "5125550100");
        assert_eq!(normalize_phone("15125550100"), "5125550100");
        assert_eq!(normalize_phone("25125550100"), "25125550100");
    }

    #[test]
    fn address_normalization_shortens_street_words() {
        assert_eq!(normalize_address("123 Main Street"), "123mainst");
        assert_eq!(normalize_address("123 main st."), "123mainst");
        assert_eq!(normalize_address("800 Oak Avenue, Suite 4"), "800oakaveste4");
    }

    #[test]
    fn similarity_is_symmetric() {
        let weights = SimilarityWeights::default();
        let a = customer(&[
            ("email", "a@x.com"),
            ("display_name", "Jon Smith"),
            ("phone", "(512) 555-0100"),
        ]);
        let b = customer(&[
            ("email", "a@x.com"),
            ("display_name", "John Smith"),
            ("phone", "1-512-555-0100"),
        ]);
        let ab = pair_similarity(&a, &b, &weights);
        let ba = pair_similarity(&b, &a, &weights);
        assert!((ab.similarity - ba.similarity).abs() < 1e-12);
        assert_eq!(ab.matching, ba.matching);
    }

    #[test]
    fn missing_field_groups_neither_penalize_nor_reward() {
        let weights = SimilarityWeights::default();
        let a = customer(&[("email", "a@x.com")]);
        let b = customer(&[("email", " A@X.COM"), ("phone", "5125550100")]);
        let pair = pair_similarity(&a, &b, &weights);
        assert_eq!(pair.similarity, 1.0);

        let phone_only = customer(&[("phone", "5125550100")]);
        let email_only = customer(&[("email", "a@x.com")]);
        assert_eq!(
            pair_similarity(&phone_only, &email_only, &weights).similarity,
            0.0
        );
    }

    #[test]
    fn trailing_phone_digits_count_as_near_match() {
        let weights = SimilarityWeights::default();
        let a = customer(&[("phone", "005125550100")]);
        let b = customer(&[("phone", "512-555-0100")]);
        let pair = pair_similarity(&a, &b, &weights);
        assert!((pair.similarity - 0.9).abs() < 1e-9);
        assert!(pair.matching.contains(&MatchField::Phone));
    }

    #[test]
    fn threshold_is_inclusive() {
        let config = DedupeConfig {
            threshold: 1.0,
            ..Default::default()
        };
        let records = vec![
            customer(&[("email", "a@x.com")]),
            customer(&[("email", "A@X.com ")]),
        ];
        let groups = detect_duplicates(&records, &config);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].record_indices, BTreeSet::from([0, 1]));
    }

    #[test]
    fn transitive_closure_merges_chained_matches() {
        let records = vec![
            customer(&[("email", "shared@x.com")]),
            customer(&[("email", "shared@x.com"), ("phone", "5125550100")]),
            customer(&[("phone", "5125550100")]),
        ];
        let weights = SimilarityWeights::default();
        assert_eq!(
            pair_similarity(&records[0], &records[2], &weights).similarity,
            0.0
        );

        let groups = detect_duplicates(&records, &DedupeConfig::default());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].record_indices, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn groups_are_disjoint_and_sorted_by_similarity() {
        let records = vec![
            customer(&[("display_name", "Jon Smith")]),
            customer(&[("display_name", "Jan Smith")]),
            customer(&[("email", "b@x.com")]),
            customer(&[("email", "b@x.com")]),
            customer(&[("email", "lonely@x.com")]),
        ];
        let groups = detect_duplicates(&records, &DedupeConfig::default());
        assert_eq!(groups.len(), 2);
        assert!(groups[0].similarity >= groups[1].similarity);
        assert_eq!(groups[0].record_indices, BTreeSet::from([2, 3]));

        let mut seen = BTreeSet::new();
        for group in &groups {
            assert!(group.record_indices.len() >= 2);
            for &index in &group.record_indices {
                assert!(seen.insert(index), "index {index} appears in two groups");
            }
        }
    }

    #[test]
    fn exact_email_and_close_name_recommend_keep_first() {
        let records = vec![
            customer(&[("email", "a@x.com"), ("display_name", "Jon Smith")]),
            customer(&[("email", "a@x.com"), ("display_name", "John Smith")]),
        ];
        let groups = detect_duplicates(&records, &DedupeConfig::default());
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert!(group.similarity > 0.95);
        assert!(group.matching_fields.contains(&MatchField::Email));
        assert_eq!(group.recommendation, Recommendation::KeepFirst);
    }

    #[test]
    fn three_matching_fields_without_email_recommend_merge() {
        let records = vec![
            customer(&[
                ("phone", "5125550100"),
                ("display_name", "Acme Plumbing"),
                ("city", "Austin"),
                ("zip", "78701"),
            ]),
            customer(&[
                ("phone", "(512) 555-0100"),
                ("display_name", "Acme Plumbing"),
                ("city", "austin"),
                ("zip", "78701-1234"),
            ]),
        ];
        let groups = detect_duplicates(&records, &DedupeConfig::default());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].matching_fields.len(), 3);
        assert_eq!(groups[0].recommendation, Recommendation::Merge);
    }

    #[test]
    fn borderline_similarity_recommends_review() {
        let records = vec![
            customer(&[("display_name", "Jon Smith")]),
            customer(&[("display_name", "Jan Smith")]),
        ];
        let groups = detect_duplicates(&records, &DedupeConfig::default());
        assert_eq!(groups.len(), 1);
        let similarity = groups[0].similarity;
        assert!(similarity > 0.85 && similarity <= 0.9);
        assert_eq!(groups[0].recommendation, Recommendation::Review);
    }

    #[test]
    fn rules_file_overrides_defaults_partially() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dedupe.yaml");
        std::fs::write(&path, "threshold: 0.8\nweights:\n  email: 40\n").expect("write rules");

        let config = DedupeConfig::from_rules_file(&path).expect("parse rules");
        assert_eq!(config.threshold, 0.8);
        assert_eq!(config.weights.email, 40.0);
        assert_eq!(config.weights.phone, 20.0);
        assert_eq!(config.merge_cutoff, 0.9);
    }

    // -- orchestrator fakes -------------------------------------------------

    #[derive(Default)]
    struct MemoryJobStore {
        jobs: Mutex<HashMap<Uuid, ImportJob>>,
    }

    impl MemoryJobStore {
        fn get(&self, job_id: Uuid) -> Option<ImportJob> {
            self.jobs.lock().unwrap().get(&job_id).cloned()
        }

        fn len(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobStore for MemoryJobStore {
        async fn create_job(&self, job: &ImportJob) -> Result<(), StoreError> {
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(())
        }

        async fn load_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
            Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
        }

        async fn update_job(&self, job: &ImportJob) -> Result<(), StoreError> {
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedRecordStore {
        fail_batches: Vec<usize>,
        calls: AtomicUsize,
        existing: Vec<CanonicalRecord>,
    }

    #[async_trait]
    impl RecordStore for ScriptedRecordStore {
        async fn insert_batch(
            &self,
            _entity: EntityType,
            records: &[CanonicalRecord],
        ) -> Result<InsertOutcome, StoreError> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if self.fail_batches.contains(&call) {
                return Err(StoreError::Message(format!(
                    "duplicate key value violates unique constraint (batch {call})"
                )));
            }
            Ok(InsertOutcome {
                inserted: Some(records.len()),
            })
        }

        async fn existing_records(
            &self,
            _entity: EntityType,
            _company_id: &str,
        ) -> Result<Vec<CanonicalRecord>, StoreError> {
            Ok(self.existing.clone())
        }
    }

    fn customer_rows(count: usize) -> Vec<RawRow> {
        (0..count)
            .map(|i| {
                let mut row = RawRow::new();
                row.insert("name".to_string(), format!("Customer {i}"));
                row.insert("email".to_string(), format!("customer{i}@example.test"));
                row
            })
            .collect()
    }

    fn request(rows: Vec<RawRow>, dry_run: bool) -> ImportRequest {
        ImportRequest {
            rows,
            headers: vec!["name".to_string(), "email".to_string()],
            data_type: "customers".to_string(),
            dry_run,
            file_name: "upload.csv".to_string(),
            company_id: "company-1".to_string(),
            user_id: "user-1".to_string(),
        }
    }

    #[tokio::test]
    async fn batch_partial_failure_keeps_remaining_batches() {
        let records = Arc::new(ScriptedRecordStore {
            fail_batches: vec![2],
            ..Default::default()
        });
        let jobs = Arc::new(MemoryJobStore::default());
        let config = ImportConfig {
            approval_threshold: 1_000,
            ..Default::default()
        };
        let pipeline = ImportPipeline::new(config, records.clone(), jobs.clone());

        let summary = pipeline
            .run(request(customer_rows(250), false))
            .await
            .expect("run");

        assert_eq!(records.calls.load(AtomicOrdering::SeqCst), 3);
        let job = jobs.get(summary.job_id).expect("job persisted");
        assert_eq!(job.status, ImportJobStatus::CompletedWithErrors);
        assert_eq!(job.processed_rows, 150);
        assert_eq!(job.insert_errors.len(), 1);
        assert_eq!(job.insert_errors[0].batch, 2);
        assert!(job.insert_errors[0].message.contains("unique constraint"));
        assert!(summary.message.contains("1 batches failed"));
    }

    #[tokio::test]
    async fn large_imports_wait_for_approval() {
        let records = Arc::new(ScriptedRecordStore::default());
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(ImportConfig::default(), records.clone(), jobs.clone());

        let summary = pipeline
            .run(request(customer_rows(101), false))
            .await
            .expect("run");

        assert!(summary.requires_approval);
        assert_eq!(records.calls.load(AtomicOrdering::SeqCst), 0);
        let job = jobs.get(summary.job_id).expect("job persisted");
        assert_eq!(job.status, ImportJobStatus::Pending);
        assert!(job.requires_approval);
    }

    #[tokio::test]
    async fn threshold_sized_imports_commit_immediately() {
        let records = Arc::new(ScriptedRecordStore::default());
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(ImportConfig::default(), records.clone(), jobs.clone());

        let summary = pipeline
            .run(request(customer_rows(100), false))
            .await
            .expect("run");

        assert!(!summary.requires_approval);
        assert_eq!(records.calls.load(AtomicOrdering::SeqCst), 1);
        let job = jobs.get(summary.job_id).expect("job persisted");
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.processed_rows, 100);
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_record_store() {
        let records = Arc::new(ScriptedRecordStore::default());
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(ImportConfig::default(), records.clone(), jobs.clone());

        let summary = pipeline
            .run(request(customer_rows(50), true))
            .await
            .expect("run");

        assert!(summary.dry_run);
        assert!(summary.message.starts_with("Dry run complete"));
        assert_eq!(records.calls.load(AtomicOrdering::SeqCst), 0);
        let job = jobs.get(summary.job_id).expect("job persisted");
        assert_eq!(job.status, ImportJobStatus::DryRun);
        assert_eq!(job.total_rows, 50);
        assert_eq!(job.valid_rows, 50);
        assert_eq!(job.processed_rows, 0);
    }

    #[tokio::test]
    async fn approval_commit_path_completes_pending_job() {
        let records = Arc::new(ScriptedRecordStore::default());
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(ImportConfig::default(), records.clone(), jobs.clone());

        let rows = customer_rows(150);
        let summary = pipeline
            .run(request(rows.clone(), false))
            .await
            .expect("run");
        assert!(summary.requires_approval);

        let approved = pipeline
            .commit_approved(summary.job_id, &rows)
            .await
            .expect("approve");
        assert_eq!(approved.job_id, summary.job_id);
        let job = jobs.get(summary.job_id).expect("job persisted");
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.processed_rows, 150);
        assert_eq!(records.calls.load(AtomicOrdering::SeqCst), 2);

        let again = pipeline.commit_approved(summary.job_id, &rows).await;
        assert!(matches!(
            again,
            Err(ImportError::NotAwaitingApproval { .. })
        ));
    }

    #[tokio::test]
    async fn empty_upload_fails_before_any_job_is_created() {
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(
            ImportConfig::default(),
            Arc::new(ScriptedRecordStore::default()),
            jobs.clone(),
        );

        let result = pipeline.run(request(Vec::new(), false)).await;
        assert!(matches!(result, Err(ImportError::EmptyFile)));
        assert_eq!(jobs.len(), 0);
    }

    #[tokio::test]
    async fn unknown_data_type_fails_before_any_job_is_created() {
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(
            ImportConfig::default(),
            Arc::new(ScriptedRecordStore::default()),
            jobs.clone(),
        );

        let mut bad = request(customer_rows(3), false);
        bad.data_type = "widgets".to_string();
        let err = pipeline.run(bad).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown data type: widgets");
        assert_eq!(jobs.len(), 0);
    }

    #[tokio::test]
    async fn invalid_rows_are_reported_and_excluded_from_commit() {
        let records = Arc::new(ScriptedRecordStore::default());
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(ImportConfig::default(), records.clone(), jobs.clone());

        let mut rows = customer_rows(2);
        let mut nameless = RawRow::new();
        nameless.insert("email".to_string(), "nobody@example.test".to_string());
        rows.insert(1, nameless);

        let summary = pipeline.run(request(rows, false)).await.expect("run");
        assert_eq!(summary.total_rows, 3);
        assert_eq!(summary.valid_rows, 2);
        assert_eq!(summary.error_rows, 1);
        assert_eq!(summary.validation_errors.len(), 1);
        assert_eq!(summary.validation_errors[0].row, 3);
        assert_eq!(
            summary.validation_errors[0].messages,
            vec!["Customer name is required".to_string()]
        );

        let job = jobs.get(summary.job_id).expect("job persisted");
        assert_eq!(job.processed_rows, 2);
    }

    #[tokio::test]
    async fn advisory_check_sees_existing_stored_records() {
        let records = Arc::new(ScriptedRecordStore {
            existing: vec![customer(&[("email", "owner@acme.test")])],
            ..Default::default()
        });
        let jobs = Arc::new(MemoryJobStore::default());
        let pipeline = ImportPipeline::new(ImportConfig::default(), records, jobs);

        let mut row = RawRow::new();
        row.insert("name".to_string(), "Acme Owner".to_string());
        row.insert("email".to_string(), "owner@acme.test".to_string());

        let summary = pipeline
            .run(request(vec![row], false))
            .await
            .expect("run");
        assert_eq!(summary.duplicate_groups, 1);
    }
}
