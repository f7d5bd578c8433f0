// crates/contextd-server/src/tenant/mod.rs
// Tenant routing - derives storage locations and search scopes from tenancy ids

pub mod registry;

pub use registry::TenantRegistry;

use crate::error::{ContextdError, Result};
use contextd_types::{CollectionType, Scope, TenantId};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Upper bound on a single tenancy name, in bytes.
const MAX_IDENT_BYTES: usize = 255;

/// Sanitiser output when a name reduces to nothing.
const EMPTY_FALLBACK: &str = "local";

fn ident_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap_or_else(|e| {
            panic!("invalid identifier regex: {e}")
        })
    })
}

/// Validate a raw tenancy name before any I/O.
///
/// Rejects anything that could smuggle path structure: empty, oversized,
/// non-conforming characters, dot entries, or names the filesystem would
/// canonicalise to something else.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ContextdError::InvalidIdentifier("empty name".into()));
    }
    if name.len() > MAX_IDENT_BYTES {
        return Err(ContextdError::InvalidIdentifier(format!(
            "name exceeds {} bytes",
            MAX_IDENT_BYTES
        )));
    }
    if name == "." || name == ".." {
        return Err(ContextdError::InvalidIdentifier(
            "dot entries are not valid names".into(),
        ));
    }
    if !ident_regex().is_match(name) {
        return Err(ContextdError::InvalidIdentifier(format!(
            "name {:?} does not match [A-Za-z0-9][A-Za-z0-9._-]*",
            name
        )));
    }
    // A valid name must survive path normalisation as a single literal
    // component, otherwise an attacker-controlled name could escape <base>.
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == std::ffi::OsStr::new(name) => Ok(()),
        _ => Err(ContextdError::InvalidIdentifier(format!(
            "name {:?} is not a plain path component",
            name
        ))),
    }
}

/// Canonicalise a validated name for use inside a physical collection name:
/// lowercase, anything outside `[a-z0-9_]` becomes `_`, runs of `_` collapse,
/// and an empty result becomes `local`. Idempotent.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for ch in name.chars() {
        let mapped = match ch.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9') => c,
            _ => '_',
        };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }
    if out.is_empty() {
        EMPTY_FALLBACK.to_string()
    } else {
        out
    }
}

/// Builds tenancy-derived storage identities: physical collection names,
/// search-scope fan-out lists, and embedded-backend directories.
///
/// Callers never supply a collection name; every input that contributes to
/// one is validated first.
#[derive(Debug, Clone)]
pub struct TenantRouter {
    base_dir: PathBuf,
}

impl TenantRouter {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Validate and assemble a tenancy tuple. `project` without `org` is
    /// impossible by construction; `team` may be absent under `project`.
    pub fn tenant(
        &self,
        org: &str,
        team: Option<&str>,
        project: Option<&str>,
    ) -> Result<TenantId> {
        validate_identifier(org)?;
        if let Some(team) = team {
            validate_identifier(team)?;
        }
        if let Some(project) = project {
            validate_identifier(project)?;
        }
        Ok(TenantId {
            org: org.to_string(),
            team: team.map(str::to_string),
            project: project.map(str::to_string),
        })
    }

    /// Physical collection name for a tenancy at a given scope.
    ///
    /// ```text
    /// org      -> org_<type>
    /// team     -> <team>_<type>
    /// project  -> [<team>_]<project>_<type>
    /// ```
    ///
    /// The org name is deliberately not mixed into team/project names; a
    /// single org hosts collision-free teams through the tenancy filter.
    pub fn collection_name(
        &self,
        scope: Scope,
        tenant: &TenantId,
        collection: CollectionType,
    ) -> Result<String> {
        match scope {
            Scope::Org => Ok(format!("org_{}", collection.as_str())),
            Scope::Team => {
                let team = tenant
                    .team
                    .as_deref()
                    .ok_or_else(|| ContextdError::InvalidArgument("team scope without team".into()))?;
                Ok(format!("{}_{}", sanitize_identifier(team), collection.as_str()))
            }
            Scope::Project => {
                let project = tenant.project.as_deref().ok_or_else(|| {
                    ContextdError::InvalidArgument("project scope without project".into())
                })?;
                let mut parts = Vec::with_capacity(3);
                if let Some(team) = tenant.team.as_deref() {
                    parts.push(sanitize_identifier(team));
                }
                parts.push(sanitize_identifier(project));
                parts.push(collection.as_str().to_string());
                Ok(parts.join("_"))
            }
        }
    }

    /// Ordered search fan-out for hierarchical reads: most specific first.
    /// Each entry narrows the tenancy to the fields its scope permits.
    pub fn search_scopes(&self, tenant: &TenantId) -> Vec<(Scope, TenantId)> {
        let mut scopes = Vec::with_capacity(3);
        if tenant.project.is_some() {
            scopes.push((Scope::Project, tenant.clone()));
        }
        if tenant.team.is_some() {
            scopes.push((
                Scope::Team,
                TenantId {
                    org: tenant.org.clone(),
                    team: tenant.team.clone(),
                    project: None,
                },
            ));
        }
        scopes.push((
            Scope::Org,
            TenantId {
                org: tenant.org.clone(),
                team: None,
                project: None,
            },
        ));
        scopes
    }

    /// On-disk directory for the embedded backend at a given scope.
    ///
    /// ```text
    /// <base>/<org>/                      org-shared
    /// <base>/<org>/<team>/               team-shared
    /// <base>/<org>/[<team>/]<project>/   project
    /// ```
    ///
    /// Directory names are the validated, unsanitised strings.
    pub fn storage_dir(&self, scope: Scope, tenant: &TenantId) -> Result<PathBuf> {
        let mut dir = self.base_dir.join(&tenant.org);
        match scope {
            Scope::Org => {}
            Scope::Team => {
                let team = tenant
                    .team
                    .as_deref()
                    .ok_or_else(|| ContextdError::InvalidArgument("team scope without team".into()))?;
                dir.push(team);
            }
            Scope::Project => {
                if let Some(team) = tenant.team.as_deref() {
                    dir.push(team);
                }
                let project = tenant.project.as_deref().ok_or_else(|| {
                    ContextdError::InvalidArgument("project scope without project".into())
                })?;
                dir.push(project);
            }
        }
        Ok(dir)
    }

    /// Create a storage directory (and parents under `<base>`) with `0700`.
    pub fn ensure_storage_dir(&self, scope: Scope, tenant: &TenantId) -> Result<PathBuf> {
        let dir = self.storage_dir(scope, tenant)?;
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut current = dir.clone();
            while current.starts_with(&self.base_dir) && current != self.base_dir {
                std::fs::set_permissions(&current, std::fs::Permissions::from_mode(0o700))?;
                if !current.pop() {
                    break;
                }
            }
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TenantRouter {
        TenantRouter::new(PathBuf::from("/tmp/contextd-test"))
    }

    #[test]
    fn test_validate_accepts_normal_names() {
        for name in ["acme", "team-1", "api.v2", "A_b-3", "x"] {
            assert!(validate_identifier(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_validate_rejects_traversal_and_shape() {
        for name in ["", ".", "..", "-lead", ".hidden", "a/b", "a\\b", "a b", "é"] {
            let err = validate_identifier(name).unwrap_err();
            assert_eq!(err.kind(), "invalid_identifier", "{name} should be rejected");
        }
    }

    #[test]
    fn test_validate_rejects_oversized() {
        let name = "a".repeat(256);
        assert!(validate_identifier(&name).is_err());
        let name = "a".repeat(255);
        assert!(validate_identifier(&name).is_ok());
    }

    #[test]
    fn test_sanitize_basic_and_idempotent() {
        assert_eq!(sanitize_identifier("simple-ctl"), "simple_ctl");
        assert_eq!(sanitize_identifier("My.Project--2"), "my_project_2");
        assert_eq!(sanitize_identifier("___"), "_");
        assert_eq!(sanitize_identifier(""), "local");

        for input in ["simple-ctl", "My.Project--2", "already_clean", ""] {
            let once = sanitize_identifier(input);
            assert_eq!(sanitize_identifier(&once), once, "not idempotent: {input}");
        }
    }

    #[test]
    fn test_sanitize_output_shape() {
        let shape = regex::Regex::new(r"^[a-z0-9_]+$").unwrap();
        for input in ["Weird Input!", "a--b__c", "ALLCAPS", "🦀"] {
            assert!(shape.is_match(&sanitize_identifier(input)));
        }
    }

    #[test]
    fn test_collection_names_follow_grammar() {
        let r = router();
        let t = r
            .tenant("acme", Some("core"), Some("simple-ctl"))
            .unwrap();

        assert_eq!(
            r.collection_name(Scope::Org, &t, CollectionType::Memories).unwrap(),
            "org_memories"
        );
        assert_eq!(
            r.collection_name(Scope::Team, &t, CollectionType::Memories).unwrap(),
            "core_memories"
        );
        assert_eq!(
            r.collection_name(Scope::Project, &t, CollectionType::Memories).unwrap(),
            "core_simple_ctl_memories"
        );
    }

    #[test]
    fn test_project_without_team_collection_name() {
        let r = router();
        let t = r.tenant("acme", None, Some("simple-ctl")).unwrap();
        assert_eq!(
            r.collection_name(Scope::Project, &t, CollectionType::Memories).unwrap(),
            "simple_ctl_memories"
        );
    }

    #[test]
    fn test_search_scope_expansion_order() {
        let r = router();

        let project = r.tenant("acme", Some("core"), Some("api")).unwrap();
        let scopes: Vec<Scope> = r.search_scopes(&project).iter().map(|(s, _)| *s).collect();
        assert_eq!(scopes, vec![Scope::Project, Scope::Team, Scope::Org]);

        let team = r.tenant("acme", Some("core"), None).unwrap();
        let scopes: Vec<Scope> = r.search_scopes(&team).iter().map(|(s, _)| *s).collect();
        assert_eq!(scopes, vec![Scope::Team, Scope::Org]);

        let org = r.tenant("acme", None, None).unwrap();
        let scopes: Vec<Scope> = r.search_scopes(&org).iter().map(|(s, _)| *s).collect();
        assert_eq!(scopes, vec![Scope::Org]);
    }

    #[test]
    fn test_scope_narrowing_drops_lower_fields() {
        let r = router();
        let t = r.tenant("acme", Some("core"), Some("api")).unwrap();
        let scopes = r.search_scopes(&t);
        let (_, team_tenant) = &scopes[1];
        assert_eq!(team_tenant.project, None);
        let (_, org_tenant) = &scopes[2];
        assert_eq!(org_tenant.team, None);
        assert_eq!(org_tenant.project, None);
    }

    #[test]
    fn test_storage_dirs_use_raw_names() {
        let r = router();
        let t = r.tenant("acme", Some("core"), Some("simple-ctl")).unwrap();

        assert_eq!(
            r.storage_dir(Scope::Project, &t).unwrap(),
            PathBuf::from("/tmp/contextd-test/acme/core/simple-ctl")
        );

        let no_team = r.tenant("acme", None, Some("simple-ctl")).unwrap();
        assert_eq!(
            r.storage_dir(Scope::Project, &no_team).unwrap(),
            PathBuf::from("/tmp/contextd-test/acme/simple-ctl")
        );

        assert_eq!(
            r.storage_dir(Scope::Org, &t).unwrap(),
            PathBuf::from("/tmp/contextd-test/acme")
        );
    }
}
