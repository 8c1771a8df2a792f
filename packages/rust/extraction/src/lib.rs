//! Oracle client for requirement extraction and generation tasks.
//!
//! Talks to an Ollama-compatible generation endpoint
//! (`POST {base_url}/api/generate` with `{model, prompt, stream: false}`).
//! The oracle is treated as unreliable by contract: extraction never raises
//! to the pipeline, it returns a tagged [`ExtractionOutcome`] so callers can
//! tell "no requirements found" from "extractor degraded".

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenderflow_shared::config::OracleConfig;
use tenderflow_shared::{Result, TenderFlowError};
use tracing::{debug, warn};

/// User agent sent to the oracle endpoint.
const USER_AGENT: &str = concat!("tenderflow/", env!("CARGO_PKG_VERSION"));

/// Quantity assumed when the oracle omits one for a requirement.
const DEFAULT_QUANTITY: u32 = 1;

/// Confidence assumed when the oracle omits the batch score.
const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Fallback prose used when the oracle cannot draft a proposal cover.
pub const DRAFT_UNAVAILABLE: &str = "Draft proposal unavailable";

/// Characters of raw oracle output kept in degradation logs.
const RAW_LOG_LIMIT: usize = 400;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// One atomic requirement extracted from tender text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRequirement {
    /// The requirement text.
    pub text: String,
    /// Inferred quantity, defaulting to 1.
    pub quantity: u32,
}

/// Result of one extraction call.
///
/// `Degraded` carries the reason the batch is empty; the pipeline records
/// it and proceeds to matching either way.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    /// The oracle produced a parseable batch (possibly empty).
    Extracted {
        requirements: Vec<ExtractedRequirement>,
        confidence: f64,
    },
    /// Transport, timeout, or parsing failed; treated as an empty batch
    /// with zero confidence.
    Degraded { reason: String },
}

impl ExtractionOutcome {
    /// The extracted batch; empty when degraded.
    pub fn requirements(&self) -> &[ExtractedRequirement] {
        match self {
            Self::Extracted { requirements, .. } => requirements,
            Self::Degraded { .. } => &[],
        }
    }

    /// Batch confidence; 0.0 when degraded.
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Extracted { confidence, .. } => *confidence,
            Self::Degraded { .. } => 0.0,
        }
    }

    /// Whether the oracle failed and the batch is a placeholder.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the generation oracle.
pub struct OracleClient {
    client: reqwest::Client,
    generate_url: String,
    model: String,
    summary_timeout: Duration,
}

impl OracleClient {
    /// Build a client from oracle settings. The extraction timeout becomes
    /// the client-wide request timeout; summarization overrides it per call.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TenderFlowError::Oracle(e.to_string()))?;

        Ok(Self {
            client,
            generate_url: format!("{}/api/generate", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            summary_timeout: Duration::from_secs(config.summary_timeout_secs),
        })
    }

    /// One generation round-trip; returns the raw generated text.
    async fn generate(&self, prompt: &str, timeout: Option<Duration>) -> Result<String> {
        let mut request = self.client.post(&self.generate_url).json(&GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        });
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TenderFlowError::Oracle(e.to_string()))?
            .error_for_status()
            .map_err(|e| TenderFlowError::Oracle(e.to_string()))?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TenderFlowError::Oracle(format!("malformed oracle response: {e}")))?;

        Ok(body.response)
    }

    /// Extract atomic requirements from tender text.
    ///
    /// Never fails: any transport or parsing problem degrades to an empty
    /// batch with confidence 0.0 and a recorded reason. The bounded request
    /// timeout resolves a hung oracle to the same degraded path.
    pub async fn extract(&self, text: &str) -> ExtractionOutcome {
        let prompt = build_extraction_prompt(text);

        let raw = match self.generate(&prompt, None).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "requirement extraction call failed");
                return ExtractionOutcome::Degraded {
                    reason: e.to_string(),
                };
            }
        };

        match parse_extraction(&raw) {
            Ok((requirements, confidence)) => {
                debug!(
                    count = requirements.len(),
                    confidence, "extraction batch parsed"
                );
                ExtractionOutcome::Extracted {
                    requirements,
                    confidence,
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    raw = truncate(&raw, RAW_LOG_LIMIT),
                    "oracle output could not be parsed"
                );
                ExtractionOutcome::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Summarize a tender into a structured JSON payload.
    ///
    /// Unlike extraction this surfaces errors: the caller stores nothing on
    /// failure and reports the reason.
    pub async fn summarize(&self, title: &str, body: &str) -> Result<serde_json::Value> {
        let prompt = build_summary_prompt(title, body);
        let raw = self
            .generate(&prompt, Some(self.summary_timeout))
            .await?;

        let span = json_span(&raw)
            .ok_or_else(|| TenderFlowError::parse("no JSON object in oracle output"))?;
        serde_json::from_str(span)
            .map_err(|e| TenderFlowError::parse(format!("oracle returned invalid JSON: {e}")))
    }

    /// Draft proposal cover prose from preformatted context sections.
    ///
    /// Falls back to a fixed sentence when the oracle is unreachable or
    /// returns nothing; the proposal document is written either way.
    pub async fn draft_cover(&self, requirements: &str, applicant: &str, pricing: &str) -> String {
        let prompt = build_cover_prompt(requirements, applicant, pricing);

        match self.generate(&prompt, None).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => DRAFT_UNAVAILABLE.into(),
            Err(e) => {
                warn!(error = %e, "proposal cover generation failed");
                DRAFT_UNAVAILABLE.into()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn build_extraction_prompt(text: &str) -> String {
    format!(
        r#"You are an information extraction system.

Extract clear, atomic requirements from the following tender.

Return ONLY valid JSON in this exact format (no explanation, no markdown):

{{
  "requirements": [
    {{"text": "requirement description", "quantity": 1}}
  ],
  "confidence": 0.9
}}

Tender text:
{text}
"#
    )
}

fn build_summary_prompt(title: &str, body: &str) -> String {
    format!(
        r#"You are a procurement analysis system.

Summarize the tender below for a reviewing officer.

Return ONLY valid JSON in EXACTLY this format:

{{
  "summary": string,
  "key_points": [string],
  "estimated_scope": string
}}

Rules:
- Do NOT include explanations outside JSON
- Be concise and professional

Tender title:
{title}

Tender text:
{body}
"#
    )
}

fn build_cover_prompt(requirements: &str, applicant: &str, pricing: &str) -> String {
    format!(
        r#"Create a professional proposal based on:

Requirements:
{requirements}

Applicant:
{applicant}

Pricing:
{pricing}
"#
    )
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Locate the JSON object span in generated text: first `{` to last `}`.
/// Tolerates prose before and after the object.
fn json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Decode the extraction payload from raw oracle output.
fn parse_extraction(raw: &str) -> Result<(Vec<ExtractedRequirement>, f64)> {
    let span = json_span(raw)
        .ok_or_else(|| TenderFlowError::parse("no JSON object in oracle output"))?;

    let value: serde_json::Value = serde_json::from_str(span)
        .map_err(|e| TenderFlowError::parse(format!("invalid JSON from oracle: {e}")))?;

    let items = value
        .get("requirements")
        .ok_or_else(|| TenderFlowError::parse("missing 'requirements' key"))?
        .as_array()
        .ok_or_else(|| TenderFlowError::parse("'requirements' is not an array"))?;

    let requirements = items
        .iter()
        .map(|item| ExtractedRequirement {
            text: item
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            quantity: coerce_quantity(item.get("quantity")),
        })
        .collect();

    let confidence = coerce_confidence(value.get("confidence"));
    Ok((requirements, confidence))
}

/// Quantity may arrive as a number or a numeric string.
fn coerce_quantity(value: Option<&serde_json::Value>) -> u32 {
    let Some(value) = value else {
        return DEFAULT_QUANTITY;
    };

    if let Some(n) = value.as_u64() {
        return u32::try_from(n).unwrap_or(u32::MAX);
    }
    if let Some(f) = value.as_f64() {
        if f.is_finite() && f >= 0.0 {
            return f as u32;
        }
        return DEFAULT_QUANTITY;
    }
    if let Some(s) = value.as_str() {
        return s.trim().parse().unwrap_or(DEFAULT_QUANTITY);
    }
    DEFAULT_QUANTITY
}

/// Confidence may arrive as a number or a numeric string; clamped to [0, 1].
fn coerce_confidence(value: Option<&serde_json::Value>) -> f64 {
    let raw = match value {
        None => DEFAULT_CONFIDENCE,
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .unwrap_or(DEFAULT_CONFIDENCE),
    };
    raw.clamp(0.0, 1.0)
}

/// Truncate a string for log output.
fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> OracleConfig {
        OracleConfig {
            base_url,
            model: "phi3:mini".into(),
            timeout_secs: 5,
            summary_timeout_secs: 5,
        }
    }

    async fn mock_oracle(server: &MockServer, generated: &str) {
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({
                "model": "phi3:mini",
                "stream": false
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "response": generated })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn extract_parses_json_with_surrounding_prose() {
        let server = MockServer::start().await;
        mock_oracle(
            &server,
            r#"Sure, here you go: {"requirements": [{"text": "Laptop for development", "quantity": 2}, {"text": "External monitor"}], "confidence": 0.85} Hope that helps!"#,
        )
        .await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let outcome = client.extract("We need laptops and monitors").await;

        assert!(!outcome.is_degraded());
        assert_eq!(outcome.confidence(), 0.85);
        let requirements = outcome.requirements();
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].text, "Laptop for development");
        assert_eq!(requirements[0].quantity, 2);
        assert_eq!(requirements[1].quantity, 1);
    }

    #[tokio::test]
    async fn extract_degrades_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let outcome = client.extract("anything").await;

        assert!(outcome.is_degraded());
        assert!(outcome.requirements().is_empty());
        assert_eq!(outcome.confidence(), 0.0);
    }

    #[tokio::test]
    async fn extract_degrades_on_non_json_output() {
        let server = MockServer::start().await;
        mock_oracle(&server, "I could not find any requirements, sorry.").await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let outcome = client.extract("anything").await;

        assert!(outcome.is_degraded());
        match outcome {
            ExtractionOutcome::Degraded { reason } => {
                assert!(reason.contains("no JSON object"));
            }
            _ => panic!("expected degraded outcome"),
        }
    }

    #[tokio::test]
    async fn extract_degrades_on_missing_requirements_key() {
        let server = MockServer::start().await;
        mock_oracle(&server, r#"{"items": [], "confidence": 0.9}"#).await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let outcome = client.extract("anything").await;

        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn extract_degrades_on_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "{}" }))
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let mut config = test_config(server.uri());
        config.timeout_secs = 1;
        let client = OracleClient::new(&config).expect("client");
        let outcome = client.extract("anything").await;

        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn extract_degrades_when_unreachable() {
        let client = OracleClient::new(&test_config("http://127.0.0.1:1".into())).expect("client");
        let outcome = client.extract("anything").await;

        assert!(outcome.is_degraded());
        assert_eq!(outcome.confidence(), 0.0);
    }

    #[tokio::test]
    async fn summarize_returns_parsed_payload() {
        let server = MockServer::start().await;
        mock_oracle(
            &server,
            r#"{"summary": "Hardware refresh", "key_points": ["10 laptops"], "estimated_scope": "small"}"#,
        )
        .await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let summary = client
            .summarize("Office refresh", "We need 10 laptops")
            .await
            .expect("summarize");

        assert_eq!(summary["summary"], "Hardware refresh");
        assert_eq!(summary["key_points"][0], "10 laptops");
    }

    #[tokio::test]
    async fn summarize_surfaces_bad_json_as_error() {
        let server = MockServer::start().await;
        mock_oracle(&server, "not json at all").await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let err = client.summarize("t", "b").await.unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[tokio::test]
    async fn draft_cover_falls_back_when_oracle_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = OracleClient::new(&test_config(server.uri())).expect("client");
        let cover = client.draft_cover("reqs", "System", "pricing").await;
        assert_eq!(cover, DRAFT_UNAVAILABLE);
    }

    #[test]
    fn json_span_finds_embedded_objects() {
        assert_eq!(json_span(r#"x {"a": 1} y"#), Some(r#"{"a": 1}"#));
        assert_eq!(json_span("no braces"), None);
        assert_eq!(json_span("} reversed {"), None);
    }

    #[test]
    fn quantity_coercion() {
        assert_eq!(coerce_quantity(None), 1);
        assert_eq!(coerce_quantity(Some(&json!(3))), 3);
        assert_eq!(coerce_quantity(Some(&json!(2.7))), 2);
        assert_eq!(coerce_quantity(Some(&json!("4"))), 4);
        assert_eq!(coerce_quantity(Some(&json!("many"))), 1);
        assert_eq!(coerce_quantity(Some(&json!(-2))), 1);
    }

    #[test]
    fn confidence_coercion_clamps() {
        assert_eq!(coerce_confidence(None), 0.9);
        assert_eq!(coerce_confidence(Some(&json!(0.5))), 0.5);
        assert_eq!(coerce_confidence(Some(&json!("0.25"))), 0.25);
        assert_eq!(coerce_confidence(Some(&json!(7.0))), 1.0);
        assert_eq!(coerce_confidence(Some(&json!(-1.0))), 0.0);
    }
}
