// crates/contextd-server/src/knowledge/mod.rs
// Knowledge services - typed domain APIs over the tenancy-scoped store

pub mod checkpoint;
pub mod memory;
pub mod remediation;

pub use checkpoint::CheckpointService;
pub use memory::MemoryService;
pub use remediation::RemediationService;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::scrub::Scrubber;
use crate::store::{CollectionRef, MetadataFilter, SearchHit, VectorStore};
use crate::tenant::{TenantRegistry, TenantRouter};
use contextd_types::{CollectionType, Scope, TenantId};
use std::collections::HashSet;
use std::sync::Arc;

/// Shared handles every knowledge service needs. Services are stateless
/// beyond this; all mutable state lives in the store, WAL, and registry.
pub struct ServiceContext {
    pub router: TenantRouter,
    pub registry: Arc<TenantRegistry>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub scrubber: Arc<Scrubber>,
}

impl ServiceContext {
    /// Collection identity at the tenant's most specific scope.
    pub fn write_ref(
        &self,
        tenant: &TenantId,
        collection: CollectionType,
    ) -> Result<CollectionRef> {
        let scope = tenant.scope();
        self.collection_ref(tenant, scope, collection)
    }

    pub fn collection_ref(
        &self,
        tenant: &TenantId,
        scope: Scope,
        collection: CollectionType,
    ) -> Result<CollectionRef> {
        let name = self.router.collection_name(scope, tenant, collection)?;
        Ok(CollectionRef {
            name,
            collection,
            scope,
            tenant: tenant.clone(),
            dimension: self.embedder.dimensions(),
        })
    }

    /// Collection identities for hierarchical read fan-out, most specific
    /// scope first.
    pub fn scoped_refs(
        &self,
        tenant: &TenantId,
        collection: CollectionType,
    ) -> Result<Vec<CollectionRef>> {
        self.router
            .search_scopes(tenant)
            .into_iter()
            .map(|(scope, scoped_tenant)| self.collection_ref(&scoped_tenant, scope, collection))
            .collect()
    }

    /// Auto-register the tenancy on first write.
    pub fn register_tenancy(&self, tenant: &TenantId) -> Result<()> {
        match (&tenant.team, &tenant.project) {
            (team, Some(project)) => {
                self.registry
                    .register_project(&tenant.org, team.as_deref(), project)?;
            }
            (Some(team), None) => {
                self.registry.register_team(&tenant.org, team)?;
            }
            (None, None) => {
                self.registry.register_org(&tenant.org)?;
            }
        }
        Ok(())
    }

    /// Search every scope in the fan-out list and union the results,
    /// de-duplicating by id with the more specific scope winning.
    pub async fn scoped_search(
        &self,
        tenant: &TenantId,
        collection: CollectionType,
        query: &[f32],
        k: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let mut seen: HashSet<uuid::Uuid> = HashSet::new();
        let mut union = Vec::new();

        for collection_ref in self.scoped_refs(tenant, collection)? {
            let hits = match self
                .store
                .search(&collection_ref, query, k, extra.clone())
                .await
            {
                Ok(hits) => hits,
                // A scope whose collection does not exist yet contributes
                // nothing; other scopes still serve.
                Err(crate::error::ContextdError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for hit in hits {
                if seen.insert(hit.record.id) {
                    union.push(hit);
                }
            }
        }
        Ok(union)
    }

    /// Find a record by id across the scope fan-out, returning the owning
    /// collection identity alongside it.
    pub async fn scoped_get(
        &self,
        tenant: &TenantId,
        collection: CollectionType,
        id: uuid::Uuid,
    ) -> Result<(CollectionRef, crate::store::Record)> {
        for collection_ref in self.scoped_refs(tenant, collection)? {
            match self.store.get(&collection_ref, id).await {
                Ok(record) => return Ok((collection_ref, record)),
                Err(crate::error::ContextdError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(crate::error::ContextdError::NotFound(id.to_string()))
    }
}

/// Join a list metadata value the way tags and source ids are stored.
pub(crate) fn join_list(values: &[String]) -> String {
    values.join(",")
}

pub(crate) fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::store::{Metadata, Record};

    #[tokio::test]
    async fn test_scoped_search_prefers_specific_scope_on_duplicate_id() {
        let t = service_context();
        let tenant_id = tenant("acme", Some("core"), Some("api"));

        let project_ref = t
            .ctx
            .collection_ref(&tenant_id, Scope::Project, CollectionType::Memories)
            .unwrap();
        let org_tenant = TenantId {
            org: "acme".into(),
            team: None,
            project: None,
        };
        let org_ref = t
            .ctx
            .collection_ref(&org_tenant, Scope::Org, CollectionType::Memories)
            .unwrap();

        // Same id written at both scopes (the consolidation/archival flows
        // never do this, but replay can).
        let mut record = Record::new(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], "dup".into(), Metadata::new());
        record.content = "project copy".into();
        let id = record.id;
        t.ctx.store.upsert(&project_ref, vec![record.clone()]).await.unwrap();
        record.content = "org copy".into();
        t.ctx.store.upsert(&org_ref, vec![record]).await.unwrap();

        let hits = t
            .ctx
            .scoped_search(
                &tenant_id,
                CollectionType::Memories,
                &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                10,
                None,
            )
            .await
            .unwrap();

        let matching: Vec<_> = hits.iter().filter(|h| h.record.id == id).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].record.content, "project copy");
    }

    #[tokio::test]
    async fn test_scoped_get_walks_up_the_hierarchy() {
        let t = service_context();
        let tenant_id = tenant("acme", None, Some("api"));

        let org_tenant = tenant("acme", None, None);
        let org_ref = t
            .ctx
            .collection_ref(&org_tenant, Scope::Org, CollectionType::Memories)
            .unwrap();
        let record = Record::new(
            vec![0.0; TEST_DIMENSIONS],
            "org-wide convention".into(),
            Metadata::new(),
        );
        let id = record.id;
        t.ctx.store.upsert(&org_ref, vec![record]).await.unwrap();

        let (found_ref, found) = t
            .ctx
            .scoped_get(&tenant_id, CollectionType::Memories, id)
            .await
            .unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found_ref.scope, Scope::Org);
    }

    #[test]
    fn test_list_round_trip_helpers() {
        let tags = vec!["go".to_string(), "net".to_string()];
        assert_eq!(split_list(Some(&join_list(&tags))), tags);
        assert!(split_list(None).is_empty());
        assert!(split_list(Some("")).is_empty());
    }
}
