//! Pipeline orchestration for TenderFlow.
//!
//! This crate ties the leaf crates together into the end-to-end tender
//! pipeline: requirement extraction, catalog matching, pricing, and the
//! proposal deliverable, with per-tender run serialization and
//! resume-from-last-committed-stage recovery.

pub mod pipeline;
pub mod proposal;

pub use pipeline::{Pipeline, PipelineReport, ProgressReporter, RunGuard, SilentProgress};
pub use proposal::{ApplicantInfo, MarkdownAssembler, ProposalAssembler};
