// crates/contextd-server/src/store/mod.rs
// Backend-agnostic vector store - one contract over remote and embedded backends

pub mod embedded;
pub mod qdrant;

pub use embedded::EmbeddedStore;
pub use qdrant::QdrantStore;

use crate::error::{ContextdError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contextd_types::{CollectionType, Scope, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Payload keys the store manages itself; domain metadata may not use them.
pub const RESERVED_KEYS: &[&str] = &[
    "id",
    "content",
    "org",
    "team",
    "project",
    "scope",
    "created_at",
    "updated_at",
];

/// A scalar metadata value.
///
/// Untagged on the wire; `Timestamp` precedes `Str` so RFC 3339 strings
/// deserialize back into timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Num(f64),
    Timestamp(DateTime<Utc>),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Num(n) => Some(*n),
            MetadataValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            MetadataValue::Num(n) => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Num(n)
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        MetadataValue::Int(n)
    }
}

impl From<u64> for MetadataValue {
    fn from(n: u64) -> Self {
        MetadataValue::Int(n as i64)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Short-key scalar metadata attached to each record.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Equality constraints ANDed onto the mandatory tenancy filter.
pub type MetadataFilter = BTreeMap<String, MetadataValue>;

/// A stored record: unit-norm vector, source content, scalar metadata,
/// and the tenancy fields that isolate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Fresh record with a service-generated id and current timestamps.
    pub fn new(vector: Vec<f32>, content: String, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            vector,
            content,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetadataValue::as_str)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(MetadataValue::as_f64)
    }

    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(MetadataValue::as_i64)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(MetadataValue::as_bool)
    }
}

/// The collection identity handed to every store call: physical name,
/// declared dimension, and the tenancy that scopes reads and writes.
///
/// Only the tenant router constructs these; callers can never smuggle in a
/// raw collection name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRef {
    pub name: String,
    pub collection: CollectionType,
    pub scope: Scope,
    pub tenant: TenantId,
    pub dimension: usize,
}

impl CollectionRef {
    /// The store fails closed: no org in the ambient tenancy means no I/O.
    pub fn require_tenancy(&self) -> Result<()> {
        if self.tenant.org.is_empty() {
            return Err(ContextdError::TenancyRequired);
        }
        Ok(())
    }

    /// The tenancy fields this collection's scope permits, as filter clauses.
    pub fn tenancy_filter(&self) -> MetadataFilter {
        let mut filter = MetadataFilter::new();
        filter.insert("org".into(), self.tenant.org.as_str().into());
        match self.scope {
            Scope::Org => {}
            Scope::Team => {
                if let Some(team) = &self.tenant.team {
                    filter.insert("team".into(), team.as_str().into());
                }
            }
            Scope::Project => {
                if let Some(team) = &self.tenant.team {
                    filter.insert("team".into(), team.as_str().into());
                }
                if let Some(project) = &self.tenant.project {
                    filter.insert("project".into(), project.as_str().into());
                }
            }
        }
        filter
    }

    /// Check a record's vector against the collection's declared dimension.
    pub fn check_dimension(&self, record: &Record) -> Result<()> {
        if record.vector.len() != self.dimension {
            return Err(ContextdError::DimensionMismatch {
                expected: self.dimension,
                actual: record.vector.len(),
            });
        }
        Ok(())
    }
}

/// One search result with its normalised score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Record,
    /// Similarity in [0, 1]; higher is closer.
    pub score: f32,
    /// True when served by the local backend while the remote was down.
    pub stale_warning: bool,
}

/// Map a cosine similarity in [-1, 1] to a score in [0, 1].
pub fn normalize_cosine(similarity: f32) -> f32 {
    ((1.0 + similarity) / 2.0).clamp(0.0, 1.0)
}

/// Cosine similarity of two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Deterministic list order: `created_at` desc, then id asc.
pub fn sort_for_listing(records: &mut [Record]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Deterministic result order: score desc, then `updated_at` desc, then id asc.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

/// Does a record satisfy every clause of an equality filter?
pub fn matches_filter(record: &Record, filter: &MetadataFilter) -> bool {
    filter.iter().all(|(key, expected)| {
        record
            .metadata
            .get(key)
            .map(|actual| actual == expected)
            .unwrap_or(false)
    })
}

/// Stamp a record's metadata with the tenancy fields its scope permits,
/// plus the bookkeeping fields every backend needs for payload isolation.
pub fn apply_tenancy(record: &mut Record, collection: &CollectionRef) {
    for (key, value) in collection.tenancy_filter() {
        record.metadata.insert(key, value);
    }
    record
        .metadata
        .insert("scope".into(), collection.scope.as_str().into());
}

/// Uniform contract over vector backends.
///
/// Every method enforces the tenancy filter of its `CollectionRef`; none of
/// them falls back to a global scan.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create the collection with cosine distance. Fails with
    /// `DimensionMismatch` if it already exists with another dimension.
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<()>;

    /// Write a batch. Embeddings must already be present; returns assigned
    /// ids in input order.
    async fn upsert(&self, collection: &CollectionRef, records: Vec<Record>) -> Result<Vec<Uuid>>;

    /// Top-k by cosine similarity under the tenancy filter AND `extra`.
    async fn search(
        &self,
        collection: &CollectionRef,
        query: &[f32],
        k: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<SearchHit>>;

    /// Fetch one record; tenancy filter still enforced.
    async fn get(&self, collection: &CollectionRef, id: Uuid) -> Result<Record>;

    /// Page through records under the tenancy filter AND `extra`, ordered
    /// by `(created_at DESC, id ASC)` for deterministic pagination.
    async fn list(
        &self,
        collection: &CollectionRef,
        limit: usize,
        offset: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<Record>>;

    /// Partial metadata update; never touches vector or content.
    async fn update(&self, collection: &CollectionRef, id: Uuid, patch: Metadata) -> Result<()>;

    /// Remove one record; tenancy filter still enforced.
    async fn delete(&self, collection: &CollectionRef, id: Uuid) -> Result<()>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Unit vector along one axis, for deterministic similarity in tests.
    pub fn axis_vector(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis % dimension] = 1.0;
        v
    }

    pub fn collection_ref(
        name: &str,
        collection: CollectionType,
        scope: Scope,
        org: &str,
        team: Option<&str>,
        project: Option<&str>,
        dimension: usize,
    ) -> CollectionRef {
        CollectionRef {
            name: name.to_string(),
            collection,
            scope,
            tenant: TenantId {
                org: org.to_string(),
                team: team.map(str::to_string),
                project: project.map(str::to_string),
            },
            dimension,
        }
    }
}
