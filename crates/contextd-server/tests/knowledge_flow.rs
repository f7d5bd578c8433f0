// crates/contextd-server/tests/knowledge_flow.rs
// End-to-end flows through the public API: record/search/feedback,
// tenant isolation, and checkpoint round-trips.

use async_trait::async_trait;
use contextd::embeddings::Embedder;
use contextd::knowledge::checkpoint::CheckpointSave;
use contextd::knowledge::memory::MemorySearchPolicy;
use contextd::knowledge::{CheckpointService, MemoryService, ServiceContext};
use contextd::scrub::Scrubber;
use contextd::store::EmbeddedStore;
use contextd::tenant::{TenantRegistry, TenantRouter};
use contextd::Result;
use contextd_types::{ResumeLevel, TenantId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const DIMENSIONS: usize = 8;

/// Deterministic embedder: registered texts get fixed vectors, everything
/// else hashes to an axis.
struct FixedEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl FixedEmbedder {
    fn new() -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, text: &str, vector: Vec<f32>) {
        self.vectors
            .lock()
            .expect("embedder lock")
            .insert(text.to_string(), vector);
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.vectors.lock().expect("embedder lock").get(text) {
            return v.clone();
        }
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let mut v = vec![0.0; DIMENSIONS];
        v[(hasher.finish() as usize) % DIMENSIONS] = 1.0;
        v
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }
}

struct Harness {
    ctx: Arc<ServiceContext>,
    embedder: Arc<FixedEmbedder>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let router = TenantRouter::new(dir.path().to_path_buf());
    let registry = Arc::new(TenantRegistry::open(dir.path()).expect("registry"));
    let embedder = Arc::new(FixedEmbedder::new());
    let ctx = Arc::new(ServiceContext {
        router: router.clone(),
        registry,
        store: Arc::new(EmbeddedStore::new(router)),
        embedder: embedder.clone(),
        scrubber: Arc::new(Scrubber::new()),
    });
    Harness {
        ctx,
        embedder,
        _dir: dir,
    }
}

fn tenant(org: &str, project: Option<&str>) -> TenantId {
    TenantId {
        org: org.to_string(),
        team: None,
        project: project.map(str::to_string),
    }
}

#[tokio::test]
async fn memory_record_search_feedback_flow() {
    let h = harness();
    let memories = MemoryService::new(h.ctx.clone());
    let acme_api = tenant("acme", Some("api"));

    h.embedder.set(
        "Use context cancellation for long RPCs",
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    );
    h.embedder.set(
        "cancel long HTTP calls",
        vec![0.95, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    );

    let recorded = memories
        .record(
            &acme_api,
            "Use context cancellation for long RPCs",
            None,
            &["go".into(), "net".into()],
        )
        .await
        .expect("record");

    let hits = memories
        .search(
            &acme_api,
            "cancel long HTTP calls",
            3,
            None,
            MemorySearchPolicy::default(),
        )
        .await
        .expect("search");
    assert_eq!(hits[0].memory.id, recorded.id);
    assert!(hits[0].score >= 0.5);

    let id = Uuid::parse_str(&recorded.id).expect("uuid");
    let after = memories
        .feedback(&acme_api, id, true, "e1")
        .await
        .expect("feedback");
    assert!((after.confidence - 0.6).abs() < 1e-9);

    // Same event id again: no further change.
    let replayed = memories
        .feedback(&acme_api, id, true, "e1")
        .await
        .expect("replay");
    assert!((replayed.confidence - 0.6).abs() < 1e-9);
    assert_eq!(replayed.usage_count, 1);
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let h = harness();
    let checkpoints = CheckpointService::new(h.ctx.clone());

    let t1 = tenant("t1", None);
    let saved = checkpoints
        .save(
            &t1,
            CheckpointSave {
                session_id: "s1".into(),
                name: "t1-cp".into(),
                summary: "t1 checkpoint summary".into(),
                description: None,
                project_path: "/work/t1".into(),
                tags: vec![],
                token_count: 10,
                full_state: None,
            },
        )
        .await
        .expect("save");

    let t2 = tenant("t2", None);
    let hits = checkpoints
        .search(&t2, "t1 checkpoint summary", 5)
        .await
        .expect("search");
    assert!(hits.is_empty());

    let id = Uuid::parse_str(&saved.id).expect("uuid");
    let err = checkpoints
        .resume(&t2, id, ResumeLevel::Summary)
        .await
        .expect_err("cross-tenant resume must fail");
    assert_eq!(err.kind(), "not_found");

    // The owner still resumes fine.
    let own = checkpoints
        .resume(&t1, id, ResumeLevel::Full)
        .await
        .expect("own resume");
    assert_eq!(own.name, "t1-cp");
}

#[tokio::test]
async fn org_scope_memories_visible_from_project_scope() {
    let h = harness();
    let memories = MemoryService::new(h.ctx.clone());

    let shared = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    h.embedder.set("org-wide convention", shared.clone());
    h.embedder.set("conventions?", shared);

    // Written at org scope...
    memories
        .record(&tenant("acme", None), "org-wide convention", None, &[])
        .await
        .expect("record");

    // ...and found from a project-scoped search through the fan-out.
    let hits = memories
        .search(
            &tenant("acme", Some("api")),
            "conventions?",
            5,
            None,
            MemorySearchPolicy::default(),
        )
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory.summary, "org-wide convention");
}
