//! Proposal document assembly.
//!
//! Takes the run's requirement batch, pricing result, and tender metadata,
//! then writes the deliverable behind the [`ProposalAssembler`] seam. The
//! default implementation renders Markdown; richer formats (docx, pdf) are
//! external collaborators that would plug in at the same seam.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tenderflow_shared::{
    PricingRecord, RequirementRecord, Result, RunId, Tender, TenderFlowError,
};
use tracing::{debug, info, instrument};

/// Who the proposal is issued for.
#[derive(Debug, Clone)]
pub struct ApplicantInfo {
    /// Display name on the proposal header.
    pub name: String,
    /// How the proposal was produced.
    pub source: String,
}

impl Default for ApplicantInfo {
    fn default() -> Self {
        Self {
            name: "System".into(),
            source: "auto_pipeline".into(),
        }
    }
}

/// Renders a run's output into a deliverable file.
pub trait ProposalAssembler: Send + Sync {
    /// Write the proposal document; returns the path to the created file.
    fn assemble(
        &self,
        tender: &Tender,
        requirements: &[RequirementRecord],
        pricing: &PricingRecord,
        applicant: &ApplicantInfo,
        cover: &str,
    ) -> Result<PathBuf>;
}

/// Writes `proposal_<run>.md` under a fixed output directory.
pub struct MarkdownAssembler {
    out_dir: PathBuf,
}

impl MarkdownAssembler {
    /// Assembler writing into `out_dir` (created on first use).
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl ProposalAssembler for MarkdownAssembler {
    #[instrument(skip_all, fields(tender_id = %tender.id, run_id = %pricing.run_id))]
    fn assemble(
        &self,
        tender: &Tender,
        requirements: &[RequirementRecord],
        pricing: &PricingRecord,
        applicant: &ApplicantInfo,
        cover: &str,
    ) -> Result<PathBuf> {
        let run_id: RunId = pricing
            .run_id
            .parse()
            .map_err(|e| TenderFlowError::validation(format!("invalid run id on pricing: {e}")))?;

        let content = render_markdown(tender, requirements, pricing, applicant, cover);
        let path = self.out_dir.join(format!("proposal_{run_id}.md"));
        write_atomic(&path, &content)?;

        info!(path = %path.display(), lines = pricing.line_items.len(), "proposal written");
        Ok(path)
    }
}

/// One line per requirement, for the document body and the cover prompt.
pub fn requirement_lines(requirements: &[RequirementRecord]) -> String {
    requirements
        .iter()
        .map(|r| format!("- {} (x{})", r.text, r.quantity))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per priced item plus totals, for the document and the cover prompt.
pub fn pricing_lines(pricing: &PricingRecord) -> String {
    let mut lines: Vec<String> = pricing
        .line_items
        .iter()
        .map(|item| format!("- {} x {}: {:.2}", item.code, item.quantity, item.amount))
        .collect();
    lines.push(format!(
        "- Margin ({}%): {:.2}",
        pricing.margin_percent, pricing.margin
    ));
    lines.push(format!("- Total: {:.2}", pricing.total));
    lines.join("\n")
}

fn render_markdown(
    tender: &Tender,
    requirements: &[RequirementRecord],
    pricing: &PricingRecord,
    applicant: &ApplicantInfo,
    cover: &str,
) -> String {
    let mut doc = String::new();

    doc.push_str("# Proposal\n\n");
    doc.push_str(&format!("Tender: {}\n", tender.title));
    doc.push_str(&format!(
        "Applicant: {} ({})\n",
        applicant.name, applicant.source
    ));
    doc.push_str(&format!("Date: {}\n\n", Utc::now().format("%Y-%m-%d")));

    if !cover.trim().is_empty() {
        doc.push_str(cover.trim());
        doc.push_str("\n\n");
    }

    doc.push_str("## Requirements\n\n");
    if requirements.is_empty() {
        doc.push_str("No requirements were extracted for this run.\n");
    } else {
        doc.push_str(&requirement_lines(requirements));
        doc.push('\n');
    }

    doc.push_str("\n## Pricing\n\n");
    doc.push_str(&pricing_lines(pricing));
    doc.push('\n');

    doc
}

/// Write `content` via a hidden temp file and rename, so readers never see
/// a half-written proposal.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TenderFlowError::io(parent, e))?;
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        TenderFlowError::validation(format!("invalid proposal path: {}", path.display()))
    })?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp_path, content).map_err(|e| TenderFlowError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| TenderFlowError::io(path, e))?;
    debug!(path = %path.display(), bytes = content.len(), "proposal file written");
    Ok(())
}
