//! Core domain types for the TenderFlow pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TenderFlowError;

// ---------------------------------------------------------------------------
// TenderId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for tender identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenderId(pub Uuid);

impl TenderId {
    /// Generate a new time-sortable tender identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TenderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TenderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers.
///
/// Every requirement batch, match set, and pricing result is scoped by the
/// run that produced it, so reruns never mix rows across batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TenderStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a tender.
///
/// Statuses move strictly forward while a pipeline run is in flight:
/// `draft -> public -> extracting -> matching -> pricing -> completed`.
/// The single allowed re-entry is `completed -> extracting`, which starts a
/// fresh run with a new [`RunId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenderStatus {
    Draft,
    Public,
    Extracting,
    Matching,
    Pricing,
    Completed,
}

impl TenderStatus {
    /// Stable string form, used for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Public => "public",
            Self::Extracting => "extracting",
            Self::Matching => "matching",
            Self::Pricing => "pricing",
            Self::Completed => "completed",
        }
    }

    /// Whether `next` is a legal transition from this status.
    pub fn can_advance_to(self, next: TenderStatus) -> bool {
        use TenderStatus::*;
        matches!(
            (self, next),
            (Draft, Public)
                | (Public, Extracting)
                | (Extracting, Matching)
                | (Matching, Pricing)
                | (Pricing, Completed)
                | (Completed, Extracting)
        )
    }

    /// Whether this status marks a finished pipeline run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for TenderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TenderStatus {
    type Err = TenderFlowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "public" => Ok(Self::Public),
            "extracting" => Ok(Self::Extracting),
            "matching" => Ok(Self::Matching),
            "pricing" => Ok(Self::Pricing),
            "completed" => Ok(Self::Completed),
            other => Err(TenderFlowError::validation(format!(
                "unknown tender status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStage
// ---------------------------------------------------------------------------

/// A pipeline stage that has been committed for a run.
///
/// Distinct from [`TenderStatus`]: a status records where a tender currently
/// is, a stage records which unit of work has durably finished. Resumption
/// restarts at the first stage after `last_stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Extracting,
    Matching,
    Pricing,
    Completed,
}

impl RunStage {
    /// Stable string form, used for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracting => "extracting",
            Self::Matching => "matching",
            Self::Pricing => "pricing",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStage {
    type Err = TenderFlowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extracting" => Ok(Self::Extracting),
            "matching" => Ok(Self::Matching),
            "pricing" => Ok(Self::Pricing),
            "completed" => Ok(Self::Completed),
            other => Err(TenderFlowError::validation(format!(
                "unknown run stage '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tender
// ---------------------------------------------------------------------------

/// A tender document moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tender {
    /// Unique identifier (UUID v7).
    pub id: TenderId,
    /// Human-readable title.
    pub title: String,
    /// Free-text body the extractor works on.
    pub body: String,
    /// Lifecycle status, the single source of truth for pipeline progress.
    pub status: TenderStatus,
    /// Oracle-generated summary payload, if one has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    /// Names of files attached to the tender.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// When the tender was created.
    pub created_at: DateTime<Utc>,
    /// When the tender was last updated.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RequirementRecord
// ---------------------------------------------------------------------------

/// One extracted requirement, persisted as part of a run's batch.
///
/// Rows are immutable once written; a rerun writes a new batch under a new
/// run id and never touches prior batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementRecord {
    /// Unique row identifier (UUID v7).
    pub id: String,
    /// Owning tender.
    pub tender_id: String,
    /// Run that produced this batch.
    pub run_id: String,
    /// Position within the batch, for stable ordering.
    pub position: u32,
    /// The requirement text.
    pub text: String,
    /// Inferred quantity (defaults to 1 when the oracle omits it).
    pub quantity: u32,
    /// Batch-level extraction confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CatalogItem
// ---------------------------------------------------------------------------

/// A sellable catalog item (SKU). Read-only input to matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Unique row identifier (UUID v7).
    pub id: String,
    /// Short SKU code, unique in the catalog.
    pub code: String,
    /// Free-text description, the matching surface.
    pub description: String,
    /// Base unit price.
    pub base_price: f64,
    /// When the item was added.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MatchRecord
// ---------------------------------------------------------------------------

/// One (requirement, retrieved-neighbor) pair from the matching stage.
///
/// Multiplicity is preserved: several requirements matching the same catalog
/// item produce several rows, which is what pricing consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Unique row identifier (UUID v7).
    pub id: String,
    /// Owning tender.
    pub tender_id: String,
    /// Run that produced this match set.
    pub run_id: String,
    /// The requirement this neighbor was retrieved for.
    pub requirement_id: String,
    /// The matched catalog item.
    pub catalog_id: String,
    /// Squared Euclidean distance between the embeddings (lower is closer).
    pub score: f64,
    /// Short tag describing how the match was made.
    pub explanation: String,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// LineItem / PricingRecord
// ---------------------------------------------------------------------------

/// One priced line in a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Catalog SKU code.
    pub code: String,
    /// Quantity carried over from the requirement.
    pub quantity: u32,
    /// `unit_price * quantity`, rounded to cents.
    pub amount: f64,
}

/// The authoritative pricing output of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRecord {
    /// Unique row identifier (UUID v7).
    pub id: String,
    /// Owning tender.
    pub tender_id: String,
    /// Run that produced this pricing.
    pub run_id: String,
    /// Priced lines, in match order.
    pub line_items: Vec<LineItem>,
    /// Sum of line amounts before margin.
    pub total_base: f64,
    /// Margin amount added on top of the base total.
    pub margin: f64,
    /// Margin-adjusted grand total.
    pub total: f64,
    /// Margin percentage that was applied.
    pub margin_percent: f64,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// Durable record of one pipeline run over a tender.
///
/// `last_stage` tracks the most recent stage whose writes landed; a run with
/// `finished_at == None` is either in flight or was interrupted and can be
/// resumed at the first uncommitted stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier (UUID v7).
    pub id: RunId,
    /// The tender this run processes.
    pub tender_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last committed stage, `None` until extraction commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stage: Option<RunStage>,
    /// Error that froze the run, if one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
