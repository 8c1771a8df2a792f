//! End-to-end tender pipeline: extraction → matching → pricing → proposal.
//!
//! The orchestrator drives a tender's status forward through the stage
//! order, persisting each stage's batch under the run's identifier. Stage
//! writes land inside a transaction together with the run's stage marker,
//! so a crashed run resumes at the first uncommitted stage instead of
//! re-extracting. Runs for one tender are serialized by [`RunGuard`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tenderflow_embedding::Embedder;
use tenderflow_extraction::{ExtractionOutcome, OracleClient};
use tenderflow_index::{Neighbor, VectorIndex};
use tenderflow_pricing::{PriceCandidate, compute_pricing};
use tenderflow_shared::{
    CatalogItem, MatchRecord, PipelineConfig, PipelineRun, PricingRecord, RequirementRecord,
    Result, RunId, RunStage, Tender, TenderFlowError, TenderId, TenderStatus,
};
use tenderflow_storage::Storage;

use crate::proposal::{ApplicantInfo, ProposalAssembler, pricing_lines, requirement_lines};

// ---------------------------------------------------------------------------
// Run guard
// ---------------------------------------------------------------------------

/// Per-tender single-flight guard.
///
/// Two simultaneous runs over the same tender would write duplicate batches
/// and race on the status field, so the second caller is refused outright,
/// not queued.
#[derive(Default)]
pub struct RunGuard {
    in_flight: std::sync::Mutex<HashSet<TenderId>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `tender_id` for a run; `None` when one is already in flight.
    pub fn try_acquire(self: &Arc<Self>, tender_id: TenderId) -> Option<RunPermit> {
        let mut in_flight = self.lock();
        if !in_flight.insert(tender_id) {
            return None;
        }
        Some(RunPermit {
            guard: Arc::clone(self),
            tender_id,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<TenderId>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A claim on one tender, released on drop.
pub struct RunPermit {
    guard: Arc<RunGuard>,
    tender_id: TenderId,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.guard.lock().remove(&self.tender_id);
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline stages.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage begins, with the status being entered.
    fn stage(&self, status: TenderStatus);
    /// Called when the run completes.
    fn done(&self, report: &PipelineReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _status: TenderStatus) {}
    fn done(&self, _report: &PipelineReport) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Result of one pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// The run that produced (or completed) the batches.
    pub run_id: RunId,
    /// The processed tender.
    pub tender_id: TenderId,
    /// Whether an interrupted run was resumed instead of starting fresh.
    pub resumed: bool,
    /// Size of the run's requirement batch.
    pub requirement_count: usize,
    /// Reason extraction degraded to an empty batch, if it did this run.
    pub extraction_degraded: Option<String>,
    /// Match rows written for the run.
    pub match_count: usize,
    /// Priced line items.
    pub line_item_count: usize,
    /// Base total before margin.
    pub total_base: f64,
    /// Margin amount applied.
    pub margin: f64,
    /// Margin-adjusted grand total.
    pub total: f64,
    /// Where the proposal document was written, if assembly succeeded.
    pub proposal_path: Option<PathBuf>,
    /// Total elapsed time.
    pub elapsed: Duration,
}

/// The stage orchestrator. Holds the collaborators one run needs; the
/// storage handle is the single writer of the tender's status while a
/// permit is held.
pub struct Pipeline<'a> {
    storage: &'a Storage,
    oracle: &'a OracleClient,
    embedder: &'a dyn Embedder,
    assembler: &'a dyn ProposalAssembler,
    guard: Arc<RunGuard>,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        storage: &'a Storage,
        oracle: &'a OracleClient,
        embedder: &'a dyn Embedder,
        assembler: &'a dyn ProposalAssembler,
        guard: Arc<RunGuard>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            oracle,
            embedder,
            assembler,
            guard,
            config,
        }
    }

    /// Fire-and-forget entry point: "run pipeline for tender X".
    ///
    /// Callers observe progress only via the tender's persisted status; a
    /// missing tender or an in-flight run is logged, never raised.
    #[instrument(skip_all, fields(tender_id = %tender_id))]
    pub async fn run(&self, tender_id: TenderId) {
        match self.execute(tender_id, &SilentProgress).await {
            Ok(report) => info!(
                run_id = %report.run_id,
                requirements = report.requirement_count,
                matches = report.match_count,
                total = report.total,
                "pipeline run complete"
            ),
            Err(e) => warn!(error = %e, "pipeline run did not complete"),
        }
    }

    /// Run (or resume) the pipeline and report what it produced.
    #[instrument(skip_all, fields(tender_id = %tender_id))]
    pub async fn execute(
        &self,
        tender_id: TenderId,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineReport> {
        let start = Instant::now();

        let Some(_permit) = self.guard.try_acquire(tender_id) else {
            return Err(TenderFlowError::validation(format!(
                "a run for tender {tender_id} is already in flight"
            )));
        };

        let Some(tender) = self.storage.get_tender(&tender_id).await? else {
            return Err(TenderFlowError::validation(format!(
                "tender {tender_id} not found"
            )));
        };

        // Open a fresh run, or pick up the tender's interrupted one.
        let (run, resumed) = match self.storage.find_open_run(&tender_id).await? {
            Some(open) => {
                info!(run_id = %open.id, last_stage = ?open.last_stage, "resuming interrupted run");
                (open, true)
            }
            None => {
                if !matches!(
                    tender.status,
                    TenderStatus::Public | TenderStatus::Completed
                ) {
                    return Err(TenderFlowError::validation(format!(
                        "tender {tender_id} is '{}', expected 'public' (or 'completed' for a rerun)",
                        tender.status
                    )));
                }
                let run = PipelineRun {
                    id: RunId::new(),
                    tender_id: tender_id.to_string(),
                    started_at: Utc::now(),
                    finished_at: None,
                    last_stage: None,
                    error: None,
                };
                self.storage.insert_run(&run).await?;
                (run, false)
            }
        };

        match self.drive(&tender, &run, progress).await {
            Ok(mut report) => {
                report.resumed = resumed;
                report.elapsed = start.elapsed();
                progress.done(&report);
                Ok(report)
            }
            Err(e) => {
                // The status stays at the failed stage; a later invocation
                // resumes from the last committed stage marker.
                if let Err(record_err) = self
                    .storage
                    .set_run_error(&run.id.to_string(), &e.to_string())
                    .await
                {
                    warn!(error = %record_err, "could not record run error");
                }
                Err(e)
            }
        }
    }

    /// Execute every stage the run has not committed yet, in order.
    async fn drive(
        &self,
        tender: &Tender,
        run: &PipelineRun,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineReport> {
        let run_id = run.id;
        let mut extraction_degraded = None;

        if !stage_committed(run.last_stage, RunStage::Extracting) {
            extraction_degraded = self.run_extracting(tender, &run_id, progress).await?;
        }
        if !stage_committed(run.last_stage, RunStage::Matching) {
            self.run_matching(tender, &run_id, progress).await?;
        }
        if !stage_committed(run.last_stage, RunStage::Pricing) {
            self.run_pricing(tender, &run_id, progress).await?;
        }
        let proposal_path = self.run_completion(tender, &run_id, progress).await?;

        let run_key = run_id.to_string();
        let requirements = self.storage.list_requirements(&tender.id, &run_key).await?;
        let matches = self.storage.list_matches(&tender.id, &run_key).await?;
        let pricing = self
            .storage
            .get_pricing(&tender.id, &run_key)
            .await?
            .ok_or_else(|| {
                TenderFlowError::Storage(format!("pricing result missing for run {run_id}"))
            })?;

        Ok(PipelineReport {
            run_id,
            tender_id: tender.id,
            resumed: false,
            requirement_count: requirements.len(),
            extraction_degraded,
            match_count: matches.len(),
            line_item_count: pricing.line_items.len(),
            total_base: pricing.total_base,
            margin: pricing.margin,
            total: pricing.total,
            proposal_path,
            elapsed: Duration::ZERO,
        })
    }

    // -----------------------------------------------------------------------
    // Stage 1: extraction
    // -----------------------------------------------------------------------

    /// Invoke the extraction oracle and persist the batch. Oracle failures
    /// degrade to an empty batch with confidence 0.0; the returned reason
    /// is surfaced in the report.
    async fn run_extracting(
        &self,
        tender: &Tender,
        run_id: &RunId,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<String>> {
        progress.stage(TenderStatus::Extracting);
        self.advance_status(&tender.id, TenderStatus::Extracting)
            .await?;

        let outcome = self.oracle.extract(&tender.body).await;
        let degraded = match &outcome {
            ExtractionOutcome::Extracted {
                requirements,
                confidence,
            } => {
                info!(
                    count = requirements.len(),
                    confidence, "requirements extracted"
                );
                None
            }
            ExtractionOutcome::Degraded { reason } => {
                warn!(reason, "extraction degraded, continuing with empty batch");
                Some(reason.clone())
            }
        };

        let confidence = outcome.confidence();
        let records: Vec<RequirementRecord> = outcome
            .requirements()
            .iter()
            .enumerate()
            .map(|(position, extracted)| RequirementRecord {
                id: Uuid::now_v7().to_string(),
                tender_id: tender.id.to_string(),
                run_id: run_id.to_string(),
                position: position as u32,
                text: extracted.text.clone(),
                quantity: extracted.quantity,
                confidence,
                created_at: Utc::now(),
            })
            .collect();

        self.storage.begin().await?;
        let write = async {
            for record in &records {
                self.storage.insert_requirement(record).await?;
            }
            self.storage
                .set_run_stage(&run_id.to_string(), RunStage::Extracting)
                .await
        };
        match write.await {
            Ok(()) => self.storage.commit().await?,
            Err(e) => return Err(self.abort_stage(e).await),
        }

        Ok(degraded)
    }

    // -----------------------------------------------------------------------
    // Stage 2: matching
    // -----------------------------------------------------------------------

    /// Build the catalog index and retrieve top-k neighbors per requirement.
    ///
    /// One immutable catalog snapshot feeds both the index builder and the
    /// position-to-item resolver, so a returned position either dereferences
    /// into the same snapshot or is discarded. Index-build failures degrade
    /// the stage to zero matches.
    async fn run_matching(
        &self,
        tender: &Tender,
        run_id: &RunId,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        progress.stage(TenderStatus::Matching);
        self.advance_status(&tender.id, TenderStatus::Matching)
            .await?;

        let catalog = self.storage.list_catalog_items().await?;
        let index = self.build_catalog_index(&catalog).await;

        let requirements = self
            .storage
            .list_requirements(&tender.id, &run_id.to_string())
            .await?;

        let mut records = Vec::new();
        if let Some(index) = &index {
            for requirement in &requirements {
                let query = self.embedder.embed(&requirement.text);
                let neighbors = match index.search(&query, self.config.top_k) {
                    Ok(neighbors) => neighbors,
                    Err(e) => {
                        warn!(error = %e, requirement = %requirement.id, "index query failed, skipping requirement");
                        continue;
                    }
                };

                records.extend(resolve_neighbors(
                    &tender.id,
                    run_id,
                    requirement,
                    &neighbors,
                    &catalog,
                ));
            }
        }

        info!(
            requirements = requirements.len(),
            matches = records.len(),
            "matching stage produced candidates"
        );

        self.storage.begin().await?;
        let write = async {
            for record in &records {
                self.storage.insert_match(record).await?;
            }
            self.storage
                .set_run_stage(&run_id.to_string(), RunStage::Matching)
                .await
        };
        match write.await {
            Ok(()) => self.storage.commit().await?,
            Err(e) => return Err(self.abort_stage(e).await),
        }

        Ok(())
    }

    /// Embed the snapshot's descriptions and build the flat index. `None`
    /// degrades matching to zero matches; an empty catalog builds an empty,
    /// searchable index and is not a failure.
    async fn build_catalog_index(&self, catalog: &[CatalogItem]) -> Option<VectorIndex> {
        let descriptions: Vec<String> = catalog
            .iter()
            .map(|item| item.description.clone())
            .collect();
        let vectors = self.embedder.embed_batch(&descriptions);

        let mut index = VectorIndex::new(self.embedder.dimension());
        if let Err(e) = index.build(vectors) {
            warn!(error = %e, "catalog index build failed, matching degrades to zero matches");
            return None;
        }

        // Any catalog change invalidates the index, so it lives in memory
        // for the run and is rebuilt from the next run's snapshot.
        Some(index)
    }

    // -----------------------------------------------------------------------
    // Stage 3: pricing
    // -----------------------------------------------------------------------

    /// Price the run's persisted matches. Candidates are rebuilt from the
    /// committed batch so a resumed run prices exactly what matching wrote.
    async fn run_pricing(
        &self,
        tender: &Tender,
        run_id: &RunId,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        progress.stage(TenderStatus::Pricing);
        self.advance_status(&tender.id, TenderStatus::Pricing)
            .await?;

        let run_key = run_id.to_string();
        let requirements = self.storage.list_requirements(&tender.id, &run_key).await?;
        let matches = self.storage.list_matches(&tender.id, &run_key).await?;
        let catalog = self.storage.list_catalog_items().await?;

        let quantities: HashMap<&str, u32> = requirements
            .iter()
            .map(|r| (r.id.as_str(), r.quantity))
            .collect();
        let items_by_id: HashMap<&str, &CatalogItem> =
            catalog.iter().map(|item| (item.id.as_str(), item)).collect();

        let candidates: Vec<PriceCandidate> = matches
            .iter()
            .map(|record| {
                let item = items_by_id.get(record.catalog_id.as_str());
                PriceCandidate {
                    code: item
                        .map(|i| i.code.clone())
                        .unwrap_or_else(|| "UNKNOWN".into()),
                    unit_price: item.map(|i| i.base_price),
                    quantity: quantities.get(record.requirement_id.as_str()).copied(),
                }
            })
            .collect();

        let breakdown = compute_pricing(&candidates, self.config.margin_percent);
        info!(
            lines = breakdown.line_items.len(),
            total = breakdown.total,
            margin = breakdown.margin,
            "pricing computed"
        );

        let record = PricingRecord {
            id: Uuid::now_v7().to_string(),
            tender_id: tender.id.to_string(),
            run_id: run_key.clone(),
            line_items: breakdown.line_items,
            total_base: breakdown.total_base,
            margin: breakdown.margin,
            total: breakdown.total,
            margin_percent: breakdown.margin_percent,
            created_at: Utc::now(),
        };

        self.storage.begin().await?;
        let write = async {
            self.storage.insert_pricing(&record).await?;
            self.storage.set_run_stage(&run_key, RunStage::Pricing).await
        };
        match write.await {
            Ok(()) => self.storage.commit().await?,
            Err(e) => return Err(self.abort_stage(e).await),
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage 4: proposal + completion
    // -----------------------------------------------------------------------

    /// Assemble the proposal document and mark the run terminal. Assembly
    /// failure is a reportable warning, not a pipeline fault.
    async fn run_completion(
        &self,
        tender: &Tender,
        run_id: &RunId,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<PathBuf>> {
        progress.stage(TenderStatus::Completed);

        let run_key = run_id.to_string();
        let requirements = self.storage.list_requirements(&tender.id, &run_key).await?;
        let pricing = self
            .storage
            .get_pricing(&tender.id, &run_key)
            .await?
            .ok_or_else(|| {
                TenderFlowError::Storage(format!("pricing result missing for run {run_id}"))
            })?;

        let applicant = ApplicantInfo::default();
        let cover = self
            .oracle
            .draft_cover(
                &requirement_lines(&requirements),
                &format!("{} ({})", applicant.name, applicant.source),
                &pricing_lines(&pricing),
            )
            .await;

        let proposal_path = match self
            .assembler
            .assemble(tender, &requirements, &pricing, &applicant, &cover)
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "proposal assembly failed, run completes without a document");
                None
            }
        };

        self.advance_status(&tender.id, TenderStatus::Completed)
            .await?;

        self.storage.begin().await?;
        let write = async {
            self.storage.set_run_stage(&run_key, RunStage::Completed).await?;
            self.storage.finish_run(&run_key).await
        };
        match write.await {
            Ok(()) => self.storage.commit().await?,
            Err(e) => return Err(self.abort_stage(e).await),
        }

        Ok(proposal_path)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Move the tender's status forward, tolerating a resumed run that
    /// already sits at the target status.
    async fn advance_status(&self, tender_id: &TenderId, to: TenderStatus) -> Result<()> {
        let current = self
            .storage
            .get_tender(tender_id)
            .await?
            .ok_or_else(|| {
                TenderFlowError::validation(format!("tender {tender_id} disappeared mid-run"))
            })?
            .status;

        if current == to {
            return Ok(());
        }
        if !current.can_advance_to(to) {
            return Err(TenderFlowError::validation(format!(
                "illegal status transition {current} -> {to}"
            )));
        }
        self.storage.set_tender_status(tender_id, to).await
    }

    /// Roll back the open transaction, keeping the stage's original error.
    async fn abort_stage(&self, err: TenderFlowError) -> TenderFlowError {
        if let Err(rollback_err) = self.storage.rollback().await {
            warn!(error = %rollback_err, "stage rollback failed");
        }
        err
    }
}

/// Resolve a requirement's neighbors into match rows against the catalog
/// snapshot the index was built from. A position outside the snapshot is
/// discarded, never dereferenced.
fn resolve_neighbors(
    tender_id: &TenderId,
    run_id: &RunId,
    requirement: &RequirementRecord,
    neighbors: &[Neighbor],
    catalog: &[CatalogItem],
) -> Vec<MatchRecord> {
    let mut records = Vec::with_capacity(neighbors.len());
    for neighbor in neighbors {
        let Some(item) = catalog.get(neighbor.position) else {
            warn!(
                position = neighbor.position,
                catalog_len = catalog.len(),
                "neighbor position outside catalog snapshot, discarded"
            );
            continue;
        };
        records.push(MatchRecord {
            id: Uuid::now_v7().to_string(),
            tender_id: tender_id.to_string(),
            run_id: run_id.to_string(),
            requirement_id: requirement.id.clone(),
            catalog_id: item.id.clone(),
            score: f64::from(neighbor.distance),
            explanation: "auto".into(),
            created_at: Utc::now(),
        });
    }
    records
}

/// Whether `stage` has already committed given the run's `last_stage` marker.
fn stage_committed(last: Option<RunStage>, stage: RunStage) -> bool {
    fn rank(stage: RunStage) -> u8 {
        match stage {
            RunStage::Extracting => 1,
            RunStage::Matching => 2,
            RunStage::Pricing => 3,
            RunStage::Completed => 4,
        }
    }
    last.is_some_and(|last| rank(last) >= rank(stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::MarkdownAssembler;
    use serde_json::json;
    use tenderflow_embedding::HashEmbedder;
    use tenderflow_shared::OracleConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestEnv {
        storage: Storage,
        oracle: OracleClient,
        assembler: MarkdownAssembler,
        config: PipelineConfig,
        data_dir: PathBuf,
    }

    impl TestEnv {
        async fn new(oracle_url: &str) -> Self {
            let data_dir = std::env::temp_dir().join(format!("tf_pipeline_{}", Uuid::now_v7()));
            let storage = Storage::open(&data_dir.join("tenderflow.db"))
                .await
                .expect("open test db");
            let oracle = OracleClient::new(&OracleConfig {
                base_url: oracle_url.into(),
                model: "phi3:mini".into(),
                timeout_secs: 5,
                summary_timeout_secs: 5,
            })
            .expect("oracle client");
            let assembler = MarkdownAssembler::new(data_dir.join("proposals"));
            let config = PipelineConfig {
                data_dir: data_dir.clone(),
                top_k: 3,
                margin_percent: 10.0,
            };
            Self {
                storage,
                oracle,
                assembler,
                config,
                data_dir,
            }
        }

        fn pipeline<'a>(&'a self, embedder: &'a dyn Embedder, guard: Arc<RunGuard>) -> Pipeline<'a> {
            Pipeline::new(
                &self.storage,
                &self.oracle,
                embedder,
                &self.assembler,
                guard,
                self.config.clone(),
            )
        }

        async fn seed_catalog(&self) {
            for (code, description, price) in [
                ("LAPTOP123", "Laptop i7 16GB 512SSD", 45000.0),
                ("LAPTOP124", "Laptop i5 8GB 256SSD", 30000.0),
                ("MON100", "24 inch monitor", 8000.0),
            ] {
                self.storage
                    .insert_catalog_item(&CatalogItem {
                        id: Uuid::now_v7().to_string(),
                        code: code.into(),
                        description: description.into(),
                        base_price: price,
                        created_at: Utc::now(),
                    })
                    .await
                    .expect("seed catalog");
            }
        }

        async fn insert_tender(&self, status: TenderStatus) -> Tender {
            let tender = Tender {
                id: TenderId::new(),
                title: "Office hardware refresh".into(),
                body: "Need 2 development laptops and a monitor".into(),
                status,
                summary: None,
                files: vec![],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.storage.insert_tender(&tender).await.expect("insert tender");
            tender
        }

        fn cleanup(&self) {
            std::fs::remove_dir_all(&self.data_dir).ok();
        }
    }

    async fn mock_oracle(server: &MockServer, generated: &str) {
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": generated })))
            .mount(server)
            .await;
    }

    /// Records each stage entry for order assertions.
    #[derive(Default)]
    struct RecordingProgress {
        stages: std::sync::Mutex<Vec<TenderStatus>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn stage(&self, status: TenderStatus) {
            self.stages
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(status);
        }
        fn done(&self, _report: &PipelineReport) {}
    }

    #[tokio::test]
    async fn full_run_drives_stages_in_order() {
        let server = MockServer::start().await;
        mock_oracle(
            &server,
            r#"{"requirements": [{"text": "Laptop for development", "quantity": 2}], "confidence": 0.85}"#,
        )
        .await;

        let env = TestEnv::new(&server.uri()).await;
        env.seed_catalog().await;
        let tender = env.insert_tender(TenderStatus::Public).await;

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let progress = RecordingProgress::default();

        let report = pipeline
            .execute(tender.id, &progress)
            .await
            .expect("pipeline run");

        let stages = progress
            .stages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        assert_eq!(
            stages,
            vec![
                TenderStatus::Extracting,
                TenderStatus::Matching,
                TenderStatus::Pricing,
                TenderStatus::Completed,
            ]
        );

        assert!(!report.resumed);
        assert!(report.extraction_degraded.is_none());
        assert_eq!(report.requirement_count, 1);
        // One requirement, three catalog items, top-3 retrieval.
        assert_eq!(report.match_count, 3);
        assert_eq!(report.line_item_count, 3);
        // All three lines carry the requirement's quantity of 2.
        assert_eq!(report.total_base, 2.0 * (45000.0 + 30000.0 + 8000.0));
        assert_eq!(report.margin, report.total_base * 0.10);
        assert_eq!(report.total, report.total_base + report.margin);

        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Completed);

        let run = env.storage.latest_run(&tender.id).await.unwrap().unwrap();
        assert_eq!(run.id, report.run_id);
        assert!(run.finished_at.is_some());
        assert_eq!(run.last_stage, Some(RunStage::Completed));

        let proposal_path = report.proposal_path.expect("proposal written");
        let content = std::fs::read_to_string(&proposal_path).expect("read proposal");
        assert!(content.contains("Laptop for development"));
        assert!(content.contains("- Total:"));

        // The catalog index lives in memory for the run; nothing lands on disk.
        assert!(!env.data_dir.join("index").exists());

        env.cleanup();
    }

    #[tokio::test]
    async fn degraded_oracle_still_completes() {
        let env = TestEnv::new("http://127.0.0.1:1").await;
        env.seed_catalog().await;
        let tender = env.insert_tender(TenderStatus::Public).await;

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let report = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .expect("degraded run still completes");

        assert!(report.extraction_degraded.is_some());
        assert_eq!(report.requirement_count, 0);
        assert_eq!(report.match_count, 0);
        assert_eq!(report.total, 0.0);

        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Completed);

        env.cleanup();
    }

    #[tokio::test]
    async fn empty_catalog_degrades_to_zero_matches() {
        let server = MockServer::start().await;
        mock_oracle(
            &server,
            r#"{"requirements": [{"text": "External monitor"}], "confidence": 0.7}"#,
        )
        .await;

        let env = TestEnv::new(&server.uri()).await;
        let tender = env.insert_tender(TenderStatus::Public).await;

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let report = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .expect("run over empty catalog");

        assert_eq!(report.requirement_count, 1);
        assert_eq!(report.match_count, 0);
        assert_eq!(report.line_item_count, 0);
        assert_eq!(report.total, 0.0);

        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Completed);

        env.cleanup();
    }

    #[tokio::test]
    async fn in_flight_run_is_refused() {
        let env = TestEnv::new("http://127.0.0.1:1").await;
        let tender = env.insert_tender(TenderStatus::Public).await;

        let guard = Arc::new(RunGuard::new());
        let _permit = guard.try_acquire(tender.id).expect("claim tender");

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::clone(&guard));
        let err = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already in flight"));

        env.cleanup();
    }

    #[test]
    fn guard_releases_on_drop() {
        let guard = Arc::new(RunGuard::new());
        let id = TenderId::new();

        let permit = guard.try_acquire(id).expect("first claim");
        assert!(guard.try_acquire(id).is_none());

        // A different tender is unaffected.
        assert!(guard.try_acquire(TenderId::new()).is_some());

        drop(permit);
        assert!(guard.try_acquire(id).is_some());
    }

    #[tokio::test]
    async fn interrupted_run_resumes_without_new_batch() {
        // Oracle unreachable: if resumption re-ran extraction, the batch
        // would come back empty instead of keeping its two rows.
        let env = TestEnv::new("http://127.0.0.1:1").await;
        env.seed_catalog().await;
        let tender = env.insert_tender(TenderStatus::Extracting).await;

        let run = PipelineRun {
            id: RunId::new(),
            tender_id: tender.id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            last_stage: Some(RunStage::Extracting),
            error: None,
        };
        env.storage.insert_run(&run).await.expect("insert run");

        for (position, text) in ["Laptop for development", "External monitor"]
            .iter()
            .enumerate()
        {
            env.storage
                .insert_requirement(&RequirementRecord {
                    id: Uuid::now_v7().to_string(),
                    tender_id: tender.id.to_string(),
                    run_id: run.id.to_string(),
                    position: position as u32,
                    text: (*text).into(),
                    quantity: 1,
                    confidence: 0.85,
                    created_at: Utc::now(),
                })
                .await
                .expect("insert requirement");
        }

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let report = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .expect("resumed run");

        assert!(report.resumed);
        assert_eq!(report.run_id, run.id);
        assert_eq!(report.requirement_count, 2);
        assert_eq!(report.match_count, 6);

        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Completed);
        let finished = env.storage.latest_run(&tender.id).await.unwrap().unwrap();
        assert!(finished.finished_at.is_some());

        env.cleanup();
    }

    #[test]
    fn neighbor_outside_snapshot_is_discarded() {
        let embedder = HashEmbedder;
        let descriptions: Vec<String> = [
            "Laptop i7 16GB 512SSD",
            "Laptop i5 8GB 256SSD",
            "24 inch monitor",
            "USB-C docking station",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let mut index = VectorIndex::new(embedder.dimension());
        index
            .build(embedder.embed_batch(&descriptions))
            .expect("build index");

        // The snapshot lost its last item after the index was built over
        // four descriptions.
        let catalog: Vec<CatalogItem> = descriptions[..3]
            .iter()
            .map(|description| CatalogItem {
                id: Uuid::now_v7().to_string(),
                code: description.split_whitespace().next().unwrap().into(),
                description: description.clone(),
                base_price: 100.0,
                created_at: Utc::now(),
            })
            .collect();

        let tender_id = TenderId::new();
        let run_id = RunId::new();
        let requirement = RequirementRecord {
            id: Uuid::now_v7().to_string(),
            tender_id: tender_id.to_string(),
            run_id: run_id.to_string(),
            position: 0,
            text: "Laptop for development".into(),
            quantity: 1,
            confidence: 0.85,
            created_at: Utc::now(),
        };

        let neighbors = index
            .search(&embedder.embed(&requirement.text), 4)
            .expect("search");
        assert_eq!(neighbors.len(), 4);

        let records = resolve_neighbors(&tender_id, &run_id, &requirement, &neighbors, &catalog);
        assert_eq!(records.len(), 3);
        let known: HashSet<&str> = catalog.iter().map(|item| item.id.as_str()).collect();
        assert!(records.iter().all(|r| known.contains(r.catalog_id.as_str())));
    }

    #[tokio::test]
    async fn stage_write_failure_freezes_run_and_records_error() {
        let env = TestEnv::new("http://127.0.0.1:1").await;
        env.seed_catalog().await;
        let tender = env.insert_tender(TenderStatus::Matching).await;

        let run = PipelineRun {
            id: RunId::new(),
            tender_id: tender.id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            last_stage: Some(RunStage::Matching),
            error: None,
        };
        env.storage.insert_run(&run).await.expect("insert run");

        // A pricing row already sits under this run, so the stage's insert
        // violates the one-result-per-run constraint and must roll back.
        env.storage
            .insert_pricing(&PricingRecord {
                id: Uuid::now_v7().to_string(),
                tender_id: tender.id.to_string(),
                run_id: run.id.to_string(),
                line_items: vec![],
                total_base: 0.0,
                margin: 0.0,
                total: 0.0,
                margin_percent: 10.0,
                created_at: Utc::now(),
            })
            .await
            .expect("plant conflicting pricing row");

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let err = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("storage error"));

        // Status froze at the failed stage and the stage marker did not move.
        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Pricing);

        let open = env.storage.find_open_run(&tender.id).await.unwrap().unwrap();
        assert_eq!(open.last_stage, Some(RunStage::Matching));
        assert!(open.finished_at.is_none());
        assert!(open.error.is_some());

        env.cleanup();
    }

    #[tokio::test]
    async fn read_only_storage_freezes_run_and_retry_resumes() {
        let env = TestEnv::new("http://127.0.0.1:1").await;
        env.seed_catalog().await;
        let tender = env.insert_tender(TenderStatus::Extracting).await;

        let run = PipelineRun {
            id: RunId::new(),
            tender_id: tender.id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            last_stage: Some(RunStage::Extracting),
            error: None,
        };
        env.storage.insert_run(&run).await.expect("insert run");

        for (position, text) in ["Laptop for development", "External monitor"]
            .iter()
            .enumerate()
        {
            env.storage
                .insert_requirement(&RequirementRecord {
                    id: Uuid::now_v7().to_string(),
                    tender_id: tender.id.to_string(),
                    run_id: run.id.to_string(),
                    position: position as u32,
                    text: (*text).into(),
                    quantity: 1,
                    confidence: 0.85,
                    created_at: Utc::now(),
                })
                .await
                .expect("insert requirement");
        }

        let readonly = Storage::open_readonly(&env.data_dir.join("tenderflow.db"))
            .await
            .expect("open read-only");
        let embedder = HashEmbedder;
        let frozen = Pipeline::new(
            &readonly,
            &env.oracle,
            &embedder,
            &env.assembler,
            Arc::new(RunGuard::new()),
            env.config.clone(),
        );
        let err = frozen
            .execute(tender.id, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));

        // Nothing moved: status and stage marker stayed where the failure
        // left them.
        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Extracting);
        let open = env.storage.find_open_run(&tender.id).await.unwrap().unwrap();
        assert_eq!(open.last_stage, Some(RunStage::Extracting));

        // A writable retry resumes at matching with the original batch.
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let report = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .expect("retry");
        assert!(report.resumed);
        assert_eq!(report.run_id, run.id);
        assert_eq!(report.requirement_count, 2);
        assert_eq!(report.match_count, 6);

        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Completed);

        env.cleanup();
    }

    #[tokio::test]
    async fn missing_tender_leaves_no_trace() {
        let env = TestEnv::new("http://127.0.0.1:1").await;
        let absent = TenderId::new();

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let err = pipeline.execute(absent, &SilentProgress).await.unwrap_err();
        assert!(err.to_string().contains("not found"));

        assert!(env.storage.latest_run(&absent).await.unwrap().is_none());

        env.cleanup();
    }

    #[tokio::test]
    async fn draft_tender_is_rejected() {
        let env = TestEnv::new("http://127.0.0.1:1").await;
        let tender = env.insert_tender(TenderStatus::Draft).await;

        let embedder = HashEmbedder;
        let pipeline = env.pipeline(&embedder, Arc::new(RunGuard::new()));
        let err = pipeline
            .execute(tender.id, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 'public'"));

        let found = env.storage.get_tender(&tender.id).await.unwrap().unwrap();
        assert_eq!(found.status, TenderStatus::Draft);

        env.cleanup();
    }

    #[test]
    fn stage_commit_ordering() {
        assert!(!stage_committed(None, RunStage::Extracting));
        assert!(stage_committed(
            Some(RunStage::Extracting),
            RunStage::Extracting
        ));
        assert!(!stage_committed(
            Some(RunStage::Extracting),
            RunStage::Matching
        ));
        assert!(stage_committed(Some(RunStage::Pricing), RunStage::Matching));
    }
}
