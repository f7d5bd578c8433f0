// crates/contextd-server/src/tenant/registry.rs
// Persisted tenancy registry - one JSON file under the storage base

use crate::error::Result;
use crate::tenant::validate_identifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const REGISTRY_FILE: &str = "registry.json";
const REGISTRY_VERSION: u32 = 1;

/// One registered tenancy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEntry {
    pub id: Uuid,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    /// org name -> entry
    tenants: BTreeMap<String, TenantEntry>,
    /// "org/team" -> entry
    teams: BTreeMap<String, TenantEntry>,
    /// "org/team/project" or "org//project" -> entry
    projects: BTreeMap<String, TenantEntry>,
}

impl RegistryFile {
    fn empty() -> Self {
        Self {
            version: REGISTRY_VERSION,
            tenants: BTreeMap::new(),
            teams: BTreeMap::new(),
            projects: BTreeMap::new(),
        }
    }
}

/// Maps every (org, team?, project?) triple to an opaque UUID.
///
/// Registration is idempotent; re-registration returns the existing id.
/// The backing file is rewritten copy-on-write (temp sibling + rename) and
/// kept `0600`; a process-wide mutex serialises updates.
pub struct TenantRegistry {
    path: PathBuf,
    state: Mutex<RegistryFile>,
}

impl TenantRegistry {
    /// Open (or create) the registry under `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(base_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        let path = base_dir.join(REGISTRY_FILE);
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            RegistryFile::empty()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Register an org; returns its UUID (existing or new).
    pub fn register_org(&self, org: &str) -> Result<Uuid> {
        validate_identifier(org)?;
        self.register(org, None, None)
    }

    /// Register a team under an org.
    pub fn register_team(&self, org: &str, team: &str) -> Result<Uuid> {
        validate_identifier(org)?;
        validate_identifier(team)?;
        self.register(org, Some(team), None)
    }

    /// Register a project under an org, optionally under a team.
    /// Parents are registered implicitly.
    pub fn register_project(&self, org: &str, team: Option<&str>, project: &str) -> Result<Uuid> {
        validate_identifier(org)?;
        if let Some(team) = team {
            validate_identifier(team)?;
        }
        validate_identifier(project)?;
        self.register(org, team, Some(project))
    }

    /// Whether the exact triple has been registered.
    pub fn exists(&self, org: &str, team: Option<&str>, project: Option<&str>) -> bool {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        match (team, project) {
            (None, None) => state.tenants.contains_key(org),
            (Some(team), None) => state.teams.contains_key(&team_key(org, team)),
            (_, Some(project)) => state.projects.contains_key(&project_key(org, team, project)),
        }
    }

    fn register(&self, org: &str, team: Option<&str>, project: Option<&str>) -> Result<Uuid> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Utc::now();
        let mut dirty = false;

        let org_id = match state.tenants.get(org) {
            Some(entry) => entry.id,
            None => {
                let entry = TenantEntry {
                    id: Uuid::new_v4(),
                    display_name: org.to_string(),
                    created_at: now,
                };
                let id = entry.id;
                state.tenants.insert(org.to_string(), entry);
                dirty = true;
                id
            }
        };

        let team_id = if let Some(team) = team {
            let key = team_key(org, team);
            match state.teams.get(&key) {
                Some(entry) => Some(entry.id),
                None => {
                    let entry = TenantEntry {
                        id: Uuid::new_v4(),
                        display_name: team.to_string(),
                        created_at: now,
                    };
                    let id = entry.id;
                    state.teams.insert(key, entry);
                    dirty = true;
                    Some(id)
                }
            }
        } else {
            None
        };

        let project_id = if let Some(project) = project {
            let key = project_key(org, team, project);
            match state.projects.get(&key) {
                Some(entry) => Some(entry.id),
                None => {
                    let entry = TenantEntry {
                        id: Uuid::new_v4(),
                        display_name: project.to_string(),
                        created_at: now,
                    };
                    let id = entry.id;
                    state.projects.insert(key, entry);
                    dirty = true;
                    Some(id)
                }
            }
        } else {
            None
        };

        if dirty {
            self.persist(&state)?;
            debug!(org, ?team, ?project, "registered tenancy");
        }

        // The most specific level is the one the caller asked about.
        Ok(project_id.or(team_id).unwrap_or(org_id))
    }

    /// Copy-on-write persist: serialise to a temp sibling, fix permissions,
    /// rename over the live file.
    fn persist(&self, state: &RegistryFile) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp, raw)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn team_key(org: &str, team: &str) -> String {
    format!("{}/{}", org, team)
}

fn project_key(org: &str, team: Option<&str>, project: &str) -> String {
    format!("{}/{}/{}", org, team.unwrap_or(""), project)
}
