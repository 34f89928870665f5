//! Test fixtures: projects, folders, users and participant groups created
//! for a run and torn down after it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{join_path, ControlPlane, FolderType};
use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureKind {
    Project,
    Folder,
    User,
    ParticipantGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    /// Container path, user email, or group label
    pub name: String,
    pub kind: FixtureKind,
    pub created_at: DateTime<Utc>,
    /// Owning container, for folders and participant groups
    #[serde(default)]
    pub parent: Option<String>,
}

impl Fixture {
    pub fn new(name: impl Into<String>, kind: FixtureKind, parent: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            created_at: Utc::now(),
            parent,
        }
    }
}

/// What to do when a project already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Use it as is; the run does not own it
    Reuse,
    /// Delete it and create a clean one
    Recreate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Collision-resistant fixture name
pub fn unique_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..8])
}

pub struct FixtureManager {
    control: Arc<dyn ControlPlane>,
    owned: Vec<Fixture>,
}

impl FixtureManager {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            owned: Vec::new(),
        }
    }

    /// Fixtures awaiting teardown, in creation order
    pub fn owned(&self) -> &[Fixture] {
        &self.owned
    }

    pub fn register_for_cleanup(&mut self, fixture: Fixture) {
        self.owned.push(fixture);
    }

    pub async fn ensure_project(&mut self, name: &str, folder_type: FolderType, freshness: Freshness) -> E2eResult<Fixture> {
        if self.control.container_exists(name).await? {
            match freshness {
                Freshness::Reuse => {
                    info!("Reusing project {}", name);
                    return Ok(Fixture::new(name, FixtureKind::Project, None));
                }
                Freshness::Recreate => {
                    info!("Recreating project {}", name);
                    self.control.delete_container(name).await?;
                    self.owned.retain(|f| !owned_by(f, name));
                }
            }
        }
        self.create(None, name, FixtureKind::Project, folder_type).await
    }

    pub async fn create_project(&mut self, name: &str, folder_type: FolderType) -> E2eResult<Fixture> {
        self.create_unique(None, name, FixtureKind::Project, folder_type)
            .await
    }

    pub async fn create_folder(&mut self, parent: &str, name: &str, folder_type: FolderType) -> E2eResult<Fixture> {
        self.create_unique(Some(parent), name, FixtureKind::Folder, folder_type)
            .await
    }

    async fn create_unique(
        &mut self,
        parent: Option<&str>,
        name: &str,
        kind: FixtureKind,
        folder_type: FolderType,
    ) -> E2eResult<Fixture> {
        let path = join_path(parent.unwrap_or(""), name);
        if self.control.container_exists(&path).await? {
            return Err(E2eError::FixtureCollision(path));
        }
        self.create(parent, name, kind, folder_type).await
    }

    async fn create(
        &mut self,
        parent: Option<&str>,
        name: &str,
        kind: FixtureKind,
        folder_type: FolderType,
    ) -> E2eResult<Fixture> {
        let path = self
            .control
            .create_container(parent, name, folder_type)
            .await?;
        info!("Created {:?} /{}", kind, path);
        let fixture = Fixture::new(path, kind, parent.map(str::to_string));
        self.owned.push(fixture.clone());
        Ok(fixture)
    }

    /// Delete users by email; users that do not exist are skipped
    pub async fn delete_users(&self, emails: &[&str]) -> E2eResult<usize> {
        let mut deleted = 0;
        for email in emails {
            if self.control.delete_user(email).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete owned fixtures newest first, so children go before their
    /// parents. Failures are logged and teardown continues.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(fixture) = self.owned.pop() {
            match self.destroy(&fixture).await {
                Ok(()) => report.deleted.push(fixture.name),
                Err(e) => {
                    warn!("Failed to delete {:?} {}: {}", fixture.kind, fixture.name, e);
                    report.failed.push((fixture.name, e.to_string()));
                }
            }
        }
        if report.is_clean() {
            info!("Teardown removed {} fixture(s)", report.deleted.len());
        }
        report
    }

    async fn destroy(&self, fixture: &Fixture) -> E2eResult<()> {
        let result = match fixture.kind {
            FixtureKind::Project | FixtureKind::Folder => self.control.delete_container(&fixture.name).await,
            FixtureKind::User => self.control.delete_user(&fixture.name).await.map(|_| ()),
            FixtureKind::ParticipantGroup => {
                let container = fixture.parent.as_deref().unwrap_or_default();
                let mut key = serde_json::Map::new();
                key.insert("Label".into(), fixture.name.clone().into());
                self.control
                    .delete_rows(container, "study", "ParticipantCategory", vec![key])
                    .await
                    .map(|_| ())
            }
        };
        match result {
            // Already gone, e.g. removed along with its parent
            Err(E2eError::Api { status: 404, .. }) => Ok(()),
            other => other,
        }
    }
}

fn owned_by(fixture: &Fixture, project: &str) -> bool {
    fixture.name == project || fixture.name.starts_with(&format!("{project}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;

    fn manager() -> (Arc<SimDriver>, FixtureManager) {
        let sim = Arc::new(SimDriver::new());
        let fixtures = FixtureManager::new(sim.clone());
        (sim, fixtures)
    }

    #[test]
    fn unique_names_differ() {
        let a = unique_name("StudyVerifyProject");
        let b = unique_name("StudyVerifyProject");
        assert!(a.starts_with("StudyVerifyProject_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn duplicate_folder_is_a_collision() {
        let (_sim, mut fixtures) = manager();
        fixtures.create_project("Proj", FolderType::Study).await.unwrap();
        fixtures
            .create_folder("Proj", "My Study", FolderType::Study)
            .await
            .unwrap();
        let err = fixtures
            .create_folder("Proj", "My Study", FolderType::Study)
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::FixtureCollision(p) if p == "Proj/My Study"));
    }

    #[tokio::test]
    async fn teardown_is_reverse_order_and_continues_past_failures() {
        let (sim, mut fixtures) = manager();
        fixtures.create_project("A", FolderType::Study).await.unwrap();
        fixtures.create_folder("A", "Child", FolderType::Study).await.unwrap();
        fixtures.create_project("B", FolderType::Study).await.unwrap();
        sim.fail_deletion_of("B");

        let report = fixtures.teardown().await;
        assert_eq!(report.deleted, ["A/Child", "A"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "B");
        assert!(fixtures.owned().is_empty());
        assert_eq!(sim.containers(), ["B"]);
    }

    #[tokio::test]
    async fn reused_project_is_not_owned() {
        let (sim, mut fixtures) = manager();
        sim.add_container("Shared");
        fixtures
            .ensure_project("Shared", FolderType::Study, Freshness::Reuse)
            .await
            .unwrap();
        assert!(fixtures.owned().is_empty());

        fixtures
            .ensure_project("Shared", FolderType::Study, Freshness::Recreate)
            .await
            .unwrap();
        assert_eq!(fixtures.owned().len(), 1);
    }

    #[tokio::test]
    async fn deleting_missing_users_is_not_an_error() {
        let (sim, fixtures) = manager();
        sim.add_user("pub_user@studyverify.test");
        let deleted = fixtures
            .delete_users(&["pub_user@studyverify.test", "ghost@studyverify.test"])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(sim.users().is_empty());
    }
}
