//! Turso Embedded / libSQL storage layer for the tender pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding tenders, the
//! catalog, requirement batches, matches, pricing results, and pipeline run
//! records. Batch tables (requirements, matches, pricing) are always read
//! and written scoped by `(tender_id, run_id)` so reruns never mix rows
//! across batches.
//!
//! **Access rules:**
//! - The pipeline and CLI write via [`Storage::open`]
//! - Inspection tooling reads via [`Storage::open_readonly`]
//!
//! Stage boundaries in the pipeline use [`Storage::begin`] /
//! [`Storage::commit`] / [`Storage::rollback`] so a stage's rows and its
//! run-record stage marker land atomically or not at all.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tenderflow_shared::{
    CatalogItem, MatchRecord, PipelineRun, PricingRecord, RequirementRecord, Result, RunStage,
    Tender, TenderFlowError, TenderId, TenderStatus,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TenderFlowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TenderFlowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TenderFlowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions (stage boundaries)
    // -----------------------------------------------------------------------

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("BEGIN", params![])
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Commit the open transaction.
    pub async fn commit(&self) -> Result<()> {
        self.conn
            .execute("COMMIT", params![])
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Roll back the open transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.conn
            .execute("ROLLBACK", params![])
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tender operations
    // -----------------------------------------------------------------------

    /// Insert a new tender record.
    pub async fn insert_tender(&self, tender: &Tender) -> Result<()> {
        self.check_writable()?;
        let files_json = serde_json::to_string(&tender.files)
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO tenders (id, title, body, status, summary_json, files_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    tender.id.to_string(),
                    tender.title.as_str(),
                    tender.body.as_str(),
                    tender.status.as_str(),
                    tender.summary.as_ref().map(|s| s.to_string()),
                    files_json.as_str(),
                    tender.created_at.to_rfc3339(),
                    tender.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a tender by ID.
    pub async fn get_tender(&self, id: &TenderId) -> Result<Option<Tender>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, body, status, summary_json, files_json, created_at, updated_at
                 FROM tenders WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_tender(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(TenderFlowError::Storage(e.to_string())),
        }
    }

    /// List all tenders, most recently created first.
    pub async fn list_tenders(&self) -> Result<Vec<Tender>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, body, status, summary_json, files_json, created_at, updated_at
                 FROM tenders ORDER BY id DESC",
                params![],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_tender(&row)?);
        }
        Ok(results)
    }

    /// Set a tender's status and bump its `updated_at` timestamp.
    pub async fn set_tender_status(&self, id: &TenderId, status: TenderStatus) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE tenders SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Store a summary payload on a tender.
    pub async fn set_tender_summary(
        &self,
        id: &TenderId,
        summary: &serde_json::Value,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE tenders SET summary_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![summary.to_string(), now.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Catalog operations
    // -----------------------------------------------------------------------

    /// Insert a catalog item. Returns `false` when the code already exists
    /// (seeding is idempotent).
    pub async fn insert_catalog_item(&self, item: &CatalogItem) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "INSERT INTO catalog_items (id, code, description, base_price, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(code) DO NOTHING",
                params![
                    item.id.as_str(),
                    item.code.as_str(),
                    item.description.as_str(),
                    item.base_price,
                    item.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// List the full catalog in stable (code) order.
    ///
    /// The matching stage reads this once per run and uses the same snapshot
    /// for index building and position resolution.
    pub async fn list_catalog_items(&self) -> Result<Vec<CatalogItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, code, description, base_price, created_at
                 FROM catalog_items ORDER BY code",
                params![],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_catalog_item(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Requirement operations
    // -----------------------------------------------------------------------

    /// Insert one requirement row of a run's batch.
    pub async fn insert_requirement(&self, requirement: &RequirementRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO requirements (id, tender_id, run_id, position, text, quantity, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    requirement.id.as_str(),
                    requirement.tender_id.as_str(),
                    requirement.run_id.as_str(),
                    i64::from(requirement.position),
                    requirement.text.as_str(),
                    i64::from(requirement.quantity),
                    requirement.confidence,
                    requirement.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List one run's requirement batch in extraction order.
    pub async fn list_requirements(
        &self,
        tender_id: &TenderId,
        run_id: &str,
    ) -> Result<Vec<RequirementRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tender_id, run_id, position, text, quantity, confidence, created_at
                 FROM requirements WHERE tender_id = ?1 AND run_id = ?2 ORDER BY position",
                params![tender_id.to_string(), run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_requirement(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Match operations
    // -----------------------------------------------------------------------

    /// Insert one match row.
    pub async fn insert_match(&self, record: &MatchRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO matches (id, tender_id, run_id, requirement_id, catalog_id, score, explanation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.as_str(),
                    record.tender_id.as_str(),
                    record.run_id.as_str(),
                    record.requirement_id.as_str(),
                    record.catalog_id.as_str(),
                    record.score,
                    record.explanation.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List one run's matches in insertion order.
    pub async fn list_matches(
        &self,
        tender_id: &TenderId,
        run_id: &str,
    ) -> Result<Vec<MatchRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tender_id, run_id, requirement_id, catalog_id, score, explanation, created_at
                 FROM matches WHERE tender_id = ?1 AND run_id = ?2 ORDER BY id",
                params![tender_id.to_string(), run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_match(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Pricing operations
    // -----------------------------------------------------------------------

    /// Insert one run's pricing result.
    pub async fn insert_pricing(&self, record: &PricingRecord) -> Result<()> {
        self.check_writable()?;
        let line_items_json = serde_json::to_string(&record.line_items)
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO pricing_results (id, tender_id, run_id, line_items_json, total_base, margin, total, margin_percent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.as_str(),
                    record.tender_id.as_str(),
                    record.run_id.as_str(),
                    line_items_json.as_str(),
                    record.total_base,
                    record.margin,
                    record.total,
                    record.margin_percent,
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get one run's pricing result.
    pub async fn get_pricing(
        &self,
        tender_id: &TenderId,
        run_id: &str,
    ) -> Result<Option<PricingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tender_id, run_id, line_items_json, total_base, margin, total, margin_percent, created_at
                 FROM pricing_results WHERE tender_id = ?1 AND run_id = ?2",
                params![tender_id.to_string(), run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_pricing(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(TenderFlowError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline run operations
    // -----------------------------------------------------------------------

    /// Insert a new pipeline run record.
    pub async fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, tender_id, started_at, finished_at, last_stage, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id.to_string(),
                    run.tender_id.as_str(),
                    run.started_at.to_rfc3339(),
                    run.finished_at.map(|t| t.to_rfc3339()),
                    run.last_stage.map(|s| s.as_str()),
                    run.error.as_deref(),
                ],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tender_id, started_at, finished_at, last_stage, error
                 FROM pipeline_runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(TenderFlowError::Storage(e.to_string())),
        }
    }

    /// Find a tender's unfinished run, if one exists (the resume target).
    pub async fn find_open_run(&self, tender_id: &TenderId) -> Result<Option<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tender_id, started_at, finished_at, last_stage, error
                 FROM pipeline_runs WHERE tender_id = ?1 AND finished_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                params![tender_id.to_string()],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(TenderFlowError::Storage(e.to_string())),
        }
    }

    /// Get a tender's most recent run, finished or not.
    pub async fn latest_run(&self, tender_id: &TenderId) -> Result<Option<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tender_id, started_at, finished_at, last_stage, error
                 FROM pipeline_runs WHERE tender_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![tender_id.to_string()],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(TenderFlowError::Storage(e.to_string())),
        }
    }

    /// Record that a run's stage has committed.
    pub async fn set_run_stage(&self, run_id: &str, stage: RunStage) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE pipeline_runs SET last_stage = ?1 WHERE id = ?2",
                params![stage.as_str(), run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Record the error that froze a run.
    pub async fn set_run_error(&self, run_id: &str, error: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE pipeline_runs SET error = ?1 WHERE id = ?2",
                params![error, run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished and clear any recorded error.
    pub async fn finish_run(&self, run_id: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE pipeline_runs SET finished_at = ?1, error = NULL WHERE id = ?2",
                params![now.as_str(), run_id],
            )
            .await
            .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row converters
// ---------------------------------------------------------------------------

/// Parse an RFC 3339 timestamp column.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TenderFlowError::Storage(format!("invalid timestamp: {e}")))
}

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| TenderFlowError::Storage(e.to_string()))
}

fn get_f64(row: &libsql::Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx)
        .map_err(|e| TenderFlowError::Storage(e.to_string()))
}

/// Convert a database row to a [`Tender`].
fn row_to_tender(row: &libsql::Row) -> Result<Tender> {
    let id: TenderId = get_string(row, 0)?
        .parse()
        .map_err(|e| TenderFlowError::Storage(format!("invalid tender id: {e}")))?;
    let status: TenderStatus = get_string(row, 3)?.parse()?;

    let summary = match row.get::<String>(4).ok() {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| TenderFlowError::Storage(format!("invalid summary json: {e}")))?,
        ),
        None => None,
    };
    let files: Vec<String> = serde_json::from_str(&get_string(row, 5)?)
        .map_err(|e| TenderFlowError::Storage(format!("invalid files json: {e}")))?;

    Ok(Tender {
        id,
        title: get_string(row, 1)?,
        body: get_string(row, 2)?,
        status,
        summary,
        files,
        created_at: parse_timestamp(&get_string(row, 6)?)?,
        updated_at: parse_timestamp(&get_string(row, 7)?)?,
    })
}

/// Convert a database row to a [`CatalogItem`].
fn row_to_catalog_item(row: &libsql::Row) -> Result<CatalogItem> {
    Ok(CatalogItem {
        id: get_string(row, 0)?,
        code: get_string(row, 1)?,
        description: get_string(row, 2)?,
        base_price: get_f64(row, 3)?,
        created_at: parse_timestamp(&get_string(row, 4)?)?,
    })
}

/// Convert a database row to a [`RequirementRecord`].
fn row_to_requirement(row: &libsql::Row) -> Result<RequirementRecord> {
    let position: i64 = row
        .get(3)
        .map_err(|e| TenderFlowError::Storage(e.to_string()))?;
    let quantity: i64 = row
        .get(5)
        .map_err(|e| TenderFlowError::Storage(e.to_string()))?;

    Ok(RequirementRecord {
        id: get_string(row, 0)?,
        tender_id: get_string(row, 1)?,
        run_id: get_string(row, 2)?,
        position: position as u32,
        text: get_string(row, 4)?,
        quantity: quantity as u32,
        confidence: get_f64(row, 6)?,
        created_at: parse_timestamp(&get_string(row, 7)?)?,
    })
}

/// Convert a database row to a [`MatchRecord`].
fn row_to_match(row: &libsql::Row) -> Result<MatchRecord> {
    Ok(MatchRecord {
        id: get_string(row, 0)?,
        tender_id: get_string(row, 1)?,
        run_id: get_string(row, 2)?,
        requirement_id: get_string(row, 3)?,
        catalog_id: get_string(row, 4)?,
        score: get_f64(row, 5)?,
        explanation: get_string(row, 6)?,
        created_at: parse_timestamp(&get_string(row, 7)?)?,
    })
}

/// Convert a database row to a [`PricingRecord`].
fn row_to_pricing(row: &libsql::Row) -> Result<PricingRecord> {
    let line_items = serde_json::from_str(&get_string(row, 3)?)
        .map_err(|e| TenderFlowError::Storage(format!("invalid line items json: {e}")))?;

    Ok(PricingRecord {
        id: get_string(row, 0)?,
        tender_id: get_string(row, 1)?,
        run_id: get_string(row, 2)?,
        line_items,
        total_base: get_f64(row, 4)?,
        margin: get_f64(row, 5)?,
        total: get_f64(row, 6)?,
        margin_percent: get_f64(row, 7)?,
        created_at: parse_timestamp(&get_string(row, 8)?)?,
    })
}

/// Convert a database row to a [`PipelineRun`].
fn row_to_run(row: &libsql::Row) -> Result<PipelineRun> {
    let id = get_string(row, 0)?
        .parse()
        .map_err(|e| TenderFlowError::Storage(format!("invalid run id: {e}")))?;

    let finished_at = match row.get::<String>(3).ok() {
        Some(raw) => Some(parse_timestamp(&raw)?),
        None => None,
    };
    let last_stage: Option<RunStage> = match row.get::<String>(4).ok() {
        Some(raw) => Some(raw.parse()?),
        None => None,
    };

    Ok(PipelineRun {
        id,
        tender_id: get_string(row, 1)?,
        started_at: parse_timestamp(&get_string(row, 2)?)?,
        finished_at,
        last_stage,
        error: row.get::<String>(5).ok(),
    })
}
