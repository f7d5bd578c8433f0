// crates/contextd-server/src/knowledge/remediation.rs
// Remediation service - error-to-fix patterns with hybrid retrieval

use super::ServiceContext;
use crate::error::{ContextdError, Result};
use crate::store::{Metadata, Record};
use contextd_types::{CollectionType, Remediation, TenantId};
use std::sync::OnceLock;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Weights of the hybrid score.
const SEMANTIC_WEIGHT: f64 = 0.7;
const SIGNATURE_WEIGHT: f64 = 0.3;

/// Results below this combined score are discarded.
pub const DEFAULT_MIN_SCORE: f64 = 0.6;

const DEFAULT_CONFIDENCE: f64 = 0.5;
const FEEDBACK_DELTA: f64 = 0.1;

/// Over-fetch factor before the hybrid re-rank cuts to k.
const FETCH_MULTIPLIER: usize = 3;

/// One remediation search result with its hybrid score.
#[derive(Debug, Clone)]
pub struct RemediationSearchHit {
    pub remediation: Remediation,
    pub score: f64,
    pub semantic_score: f32,
    pub signature_similarity: f64,
    pub stale_warning: bool,
}

pub struct RemediationService {
    ctx: Arc<ServiceContext>,
}

impl RemediationService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Record an error-to-fix pattern. The original message is embedded;
    /// the normalised signature rides in metadata for string matching.
    pub async fn record(
        &self,
        tenant: &TenantId,
        error_message: &str,
        solution: &str,
        context: Option<&str>,
    ) -> Result<Remediation> {
        if error_message.trim().is_empty() {
            return Err(ContextdError::InvalidArgument("empty error message".into()));
        }
        if solution.trim().is_empty() {
            return Err(ContextdError::InvalidArgument("empty solution".into()));
        }
        self.ctx.register_tenancy(tenant)?;

        let error_message = self.ctx.scrubber.scrub_text(error_message);
        let solution = self.ctx.scrubber.scrub_text(solution);
        let context = context.map(|c| self.ctx.scrubber.scrub_text(c));

        let signature = normalize_signature(&error_message);
        let vector = self.ctx.embedder.embed(&error_message).await?;

        let mut metadata = Metadata::new();
        metadata.insert("error_signature".into(), signature.as_str().into());
        metadata.insert("solution".into(), solution.as_str().into());
        if let Some(context) = &context {
            metadata.insert("context".into(), context.as_str().into());
        }
        metadata.insert("confidence".into(), DEFAULT_CONFIDENCE.into());

        let record = Record::new(vector, error_message, metadata);
        let collection = self.ctx.write_ref(tenant, CollectionType::Remediations)?;
        let ids = self.ctx.store.upsert(&collection, vec![record.clone()]).await?;
        debug!(id = %ids[0], "recorded remediation");

        record_to_remediation(&record)
    }

    /// Hybrid search: `0.7 × semantic + 0.3 × signature similarity`.
    /// Ties break by confidence, then `updated_at`.
    pub async fn search(
        &self,
        tenant: &TenantId,
        error_message: &str,
        k: usize,
        min_score: Option<f64>,
    ) -> Result<Vec<RemediationSearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let threshold = min_score.unwrap_or(DEFAULT_MIN_SCORE);
        let query_signature = normalize_signature(error_message);
        let vector = self.ctx.embedder.embed(error_message).await?;

        let hits = self
            .ctx
            .scoped_search(
                tenant,
                CollectionType::Remediations,
                &vector,
                k * FETCH_MULTIPLIER,
                None,
            )
            .await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let remediation = match record_to_remediation(&hit.record) {
                Ok(r) => r,
                Err(e) => {
                    debug!(id = %hit.record.id, error = %e, "skipping malformed remediation");
                    continue;
                }
            };
            let signature_similarity =
                levenshtein_similarity(&query_signature, &remediation.error_signature);
            let score =
                SEMANTIC_WEIGHT * hit.score as f64 + SIGNATURE_WEIGHT * signature_similarity;
            if score < threshold {
                continue;
            }
            results.push(RemediationSearchHit {
                remediation,
                score,
                semantic_score: hit.score,
                signature_similarity,
                stale_warning: hit.stale_warning,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.remediation
                        .confidence
                        .partial_cmp(&a.remediation.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.remediation.updated_at.cmp(&a.remediation.updated_at))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Adjust confidence after the fix was tried.
    pub async fn feedback(&self, tenant: &TenantId, id: Uuid, helpful: bool) -> Result<Remediation> {
        let (collection, record) = self
            .ctx
            .scoped_get(tenant, CollectionType::Remediations, id)
            .await?;

        let confidence = record.meta_f64("confidence").unwrap_or(DEFAULT_CONFIDENCE);
        let confidence = if helpful {
            (confidence + FEEDBACK_DELTA).min(1.0)
        } else {
            (confidence - FEEDBACK_DELTA).max(0.0)
        };

        let mut patch = Metadata::new();
        patch.insert("confidence".into(), confidence.into());
        self.ctx.store.update(&collection, id, patch).await?;

        let updated = self.ctx.store.get(&collection, id).await?;
        record_to_remediation(&updated)
    }

    /// Short human-readable diagnosis from the top matches.
    pub async fn diagnose(&self, tenant: &TenantId, error_message: &str) -> Result<String> {
        let hits = self.search(tenant, error_message, 3, None).await?;
        if hits.is_empty() {
            return Ok("No known remediation matches this error.".to_string());
        }

        let mut out = format!("{} known remediation(s) match:\n", hits.len());
        for (i, hit) in hits.iter().enumerate() {
            out.push_str(&format!(
                "{}. [{:.2}] {}\n   Fix: {}\n",
                i + 1,
                hit.score,
                hit.remediation.error_message,
                hit.remediation.solution
            ));
        }
        Ok(out)
    }
}

fn record_to_remediation(record: &Record) -> Result<Remediation> {
    let solution = record
        .meta_str("solution")
        .ok_or_else(|| ContextdError::Other(format!("remediation {} missing solution", record.id)))?
        .to_string();
    Ok(Remediation {
        id: record.id.to_string(),
        error_signature: record
            .meta_str("error_signature")
            .unwrap_or_default()
            .to_string(),
        error_message: record.content.clone(),
        solution,
        context: record.meta_str("context").map(str::to_string),
        confidence: record.meta_f64("confidence").unwrap_or(DEFAULT_CONFIDENCE),
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

/// Normalise an error message into a comparable signature: quoted literals,
/// UUIDs, hex runs, path-like tokens, and digit runs all become `*`.
pub fn normalize_signature(message: &str) -> String {
    struct Patterns {
        quoted: regex::Regex,
        uuid: regex::Regex,
        hex: regex::Regex,
        path: regex::Regex,
        digits: regex::Regex,
    }
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| Patterns {
        quoted: regex::Regex::new(r#""[^"]*"|'[^']*'"#).unwrap_or_else(|e| panic!("quoted: {e}")),
        uuid: regex::Regex::new(
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
        )
        .unwrap_or_else(|e| panic!("uuid: {e}")),
        hex: regex::Regex::new(r"\b[0-9a-fA-F]{8,}\b").unwrap_or_else(|e| panic!("hex: {e}")),
        path: regex::Regex::new(r"(?:~|\.{1,2})?(?:/[\w.\-]+){2,}/?|\b[\w.\-]+(?:/[\w.\-]+)+\b")
            .unwrap_or_else(|e| panic!("path: {e}")),
        digits: regex::Regex::new(r"\d+").unwrap_or_else(|e| panic!("digits: {e}")),
    });

    let out = patterns.quoted.replace_all(message, "*");
    let out = patterns.uuid.replace_all(&out, "*");
    let out = patterns.hex.replace_all(&out, "*");
    let out = patterns.path.replace_all(&out, "*");
    let out = patterns.digits.replace_all(&out, "*");
    out.trim().to_string()
}

/// Normalised Levenshtein similarity in [0, 1].
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let distance = levenshtein(a, b) as f64;
    let max_len = a.chars().count().max(b.chars().count()) as f64;
    1.0 - distance / max_len
}

/// Classic two-row Levenshtein over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
