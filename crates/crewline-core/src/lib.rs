//! Core domain model for the crewline bulk import pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crewline-core";

/// How many entries a persisted job keeps per error list.
pub const STORED_ERROR_CAP: usize = 100;
/// How many validation errors the synchronous response echoes back.
pub const RESPONSE_ERROR_SAMPLE: usize = 10;
/// Fixed commit batch size.
pub const INSERT_BATCH_SIZE: usize = 100;
/// Imports with more rows than this are held for manual approval.
pub const APPROVAL_ROW_THRESHOLD: usize = 100;

/// The record kinds tenants can bulk-upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Customer,
    Job,
    Material,
    Vendor,
}

impl EntityType {
    /// Accepts both singular and plural selectors, as upload forms send either.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "customer" | "customers" => Some(Self::Customer),
            "job" | "jobs" => Some(Self::Job),
            "material" | "materials" => Some(Self::Material),
            "vendor" | "vendors" => Some(Self::Vendor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Job => "job",
            Self::Material => "material",
            Self::Vendor => "vendor",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded row: normalized source column name mapped to its cell value.
pub type RawRow = BTreeMap<String, String>;

/// One normalized row keyed by canonical target field names.
///
/// Produced by the field mapper; immutable once validated. Invalid records are
/// kept only for error reporting and never committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity: EntityType,
    pub fields: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            fields: BTreeMap::new(),
        }
    }

    /// Returns the field value when present and non-empty.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }
}

/// Row-level validation failure, keyed by the spreadsheet-visible row number
/// (1-based data row plus the header row, so raw index 0 reports as row 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub messages: Vec<String>,
}

/// Spreadsheet-visible row number for a 0-based data row index.
pub fn display_row(data_index: usize) -> usize {
    data_index + 2
}

/// Weights for the comparable field groups used by duplicate detection.
///
/// A group's weight only enters the denominator when the group is present on
/// both compared records, so missing fields neither penalize nor reward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub email: f64,
    pub phone: f64,
    pub name: f64,
    pub address: f64,
    pub city_zip: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            email: 30.0,
            phone: 20.0,
            name: 25.0,
            address: 15.0,
            city_zip: 10.0,
        }
    }
}

/// Field groups that can back a duplicate match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Email,
    Phone,
    Name,
    Address,
    CityZip,
}

/// Suggested resolution for a duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    KeepFirst,
    Merge,
    Review,
}

/// A transitive-closure cluster of probable duplicates.
///
/// `similarity` is the running average of the pairwise scores that merged
/// members into the group. Groups returned together are pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: Uuid,
    pub record_indices: BTreeSet<usize>,
    pub similarity: f64,
    pub matching_fields: BTreeSet<MatchField>,
    pub recommendation: Recommendation,
}

/// Import job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    DryRun,
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
}

impl ImportJobStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dry_run" => Some(Self::DryRun),
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
        }
    }

    /// A terminal job is never re-opened.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DryRun | Self::Completed | Self::CompletedWithErrors
        )
    }

    /// Status is write-once-per-transition and monotonic: pending jobs move to
    /// processing when approved, and processing jobs finish exactly once.
    pub fn can_transition(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::CompletedWithErrors)
        )
    }
}

impl fmt::Display for ImportJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed commit batch, keyed by 1-based batch number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertError {
    pub batch: usize,
    pub message: String,
}

/// Audit record for one upload. Created once per file, mutated only by the
/// import orchestrator, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub company_id: String,
    pub user_id: String,
    pub data_type: EntityType,
    pub status: ImportJobStatus,
    pub file_name: String,
    pub total_rows: usize,
    pub valid_rows: usize,
    pub error_rows: usize,
    pub dry_run: bool,
    pub requires_approval: bool,
    pub validation_errors: Vec<RowError>,
    pub headers_found: Vec<String>,
    pub processed_rows: usize,
    pub insert_errors: Vec<InsertError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// Applies `next` only when the lifecycle allows it.
    pub fn transition(&mut self, next: ImportJobStatus) -> bool {
        if !self.status.can_transition(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Synchronous response returned to the uploader.
///
/// Serialized camelCase because the import UI consumes it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub job_id: Uuid,
    pub total_rows: usize,
    pub valid_rows: usize,
    pub error_rows: usize,
    pub duplicate_groups: usize,
    pub requires_approval: bool,
    pub dry_run: bool,
    pub validation_errors: Vec<RowError>,
    pub headers_found: Vec<String>,
    pub message: String,
}
