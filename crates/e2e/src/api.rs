//! HTTP control plane
//!
//! Setup and verification steps that do not need the browser go through
//! [`ControlPlane`]: container lifecycle, user cleanup, raw query rows and
//! pipeline job status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::filter::Filter;

pub type Row = Map<String, Value>;

/// Folder type applied when a container is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FolderType {
    #[default]
    Study,
    Assay,
    Collaboration,
    Custom,
}

impl FolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderType::Study => "Study",
            FolderType::Assay => "Assay",
            FolderType::Collaboration => "Collaboration",
            FolderType::Custom => "Custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled)
    }

    /// Parse the status column of the pipeline job table
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "COMPLETE" => JobStatus::Complete,
            "ERROR" => JobStatus::Error,
            "CANCELLED" | "CANCELLING" => JobStatus::Cancelled,
            "WAITING" | "SPLIT WAITING" => JobStatus::Waiting,
            _ => JobStatus::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub description: String,
    pub status: JobStatus,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn select_rows(
        &self,
        container: &str,
        schema: &str,
        query: &str,
        filters: &[Filter],
    ) -> E2eResult<Vec<Row>>;

    /// Returns the number of rows inserted
    async fn insert_rows(&self, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize>;

    /// Rows are identified by their key columns; returns the number deleted
    async fn delete_rows(&self, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize>;

    async fn container_exists(&self, path: &str) -> E2eResult<bool>;

    /// Create `name` under `parent` (or as a project); returns the new path
    async fn create_container(&self, parent: Option<&str>, name: &str, folder_type: FolderType) -> E2eResult<String>;

    async fn delete_container(&self, path: &str) -> E2eResult<()>;

    /// `false` when no such user exists
    async fn delete_user(&self, email: &str) -> E2eResult<bool>;

    async fn list_jobs(&self, container: &str) -> E2eResult<Vec<JobInfo>>;
}

/// `ControlPlane` over the server's JSON endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl ApiClient {
    pub fn new(config: &HarnessConfig) -> E2eResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let credentials = config
            .username
            .clone()
            .map(|u| (u, config.password.clone().unwrap_or_default()));
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, controller: &str, container: &str, action: &str) -> String {
        let container = container.trim_matches('/');
        if container.is_empty() {
            format!("{}/{}/{}", self.base_url, controller, action)
        } else {
            format!("{}/{}/{}/{}", self.base_url, controller, container, action)
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, Some(password)),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> E2eResult<Value> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(E2eError::Api {
                status: status.as_u16(),
                message: api_message(&body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn post(&self, url: String, body: Value) -> E2eResult<Value> {
        debug!("POST {}", url);
        self.send(self.http.post(url).json(&body)).await
    }

    async fn modify_rows(&self, action: &str, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize> {
        let body = json!({
            "schemaName": schema,
            "queryName": query,
            "rows": rows,
        });
        let resp = self.post(self.url("query", container, action), body).await?;
        Ok(resp
            .get("rowsAffected")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize)
    }
}

/// Pull the server's `exception` text out of an error body when present
fn api_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("exception").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Display text of a JSON cell; null is empty
pub(crate) fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn select_rows(
        &self,
        container: &str,
        schema: &str,
        query: &str,
        filters: &[Filter],
    ) -> E2eResult<Vec<Row>> {
        let url = self.url("query", container, "selectRows.api");
        let mut params = vec![
            ("schemaName".to_string(), schema.to_string()),
            ("query.queryName".to_string(), query.to_string()),
        ];
        params.extend(filters.iter().map(|f| f.query_param("query")));
        debug!("GET {} {:?}", url, params);

        let resp = self.send(self.http.get(url).query(&params)).await?;
        let rows = match resp.get("rows") {
            Some(Value::Array(rows)) => rows
                .iter()
                .filter_map(|r| r.as_object().cloned())
                .collect(),
            _ => Vec::new(),
        };
        Ok(rows)
    }

    async fn insert_rows(&self, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize> {
        self.modify_rows("insertRows.api", container, schema, query, rows).await
    }

    async fn delete_rows(&self, container: &str, schema: &str, query: &str, rows: Vec<Row>) -> E2eResult<usize> {
        self.modify_rows("deleteRows.api", container, schema, query, rows).await
    }

    async fn container_exists(&self, path: &str) -> E2eResult<bool> {
        let url = self.url("project", path, "getContainers.api");
        match self.send(self.http.get(url)).await {
            Ok(_) => Ok(true),
            Err(E2eError::Api { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, parent: Option<&str>, name: &str, folder_type: FolderType) -> E2eResult<String> {
        let parent = parent.unwrap_or("");
        let body = json!({ "name": name, "folderType": folder_type.as_str() });
        let resp = self.post(self.url("core", parent, "createContainer.api"), body).await?;
        let path = resp
            .get("path")
            .and_then(Value::as_str)
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_else(|| join_path(parent, name));
        Ok(path)
    }

    async fn delete_container(&self, path: &str) -> E2eResult<()> {
        self.post(self.url("core", path, "deleteContainer.api"), json!({}))
            .await
            .map(|_| ())
    }

    async fn delete_user(&self, email: &str) -> E2eResult<bool> {
        let url = self.url("security", "", "deleteUsers.api");
        match self.post(url, json!({ "emails": [email] })).await {
            Ok(resp) => Ok(resp
                .get("deleted")
                .and_then(Value::as_u64)
                .map(|n| n > 0)
                .unwrap_or(true)),
            Err(E2eError::Api { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_jobs(&self, container: &str) -> E2eResult<Vec<JobInfo>> {
        let rows = self.select_rows(container, "pipeline", "job", &[]).await?;
        Ok(rows
            .iter()
            .map(|row| JobInfo {
                id: row.get("RowId").map(cell_text).unwrap_or_default(),
                description: row.get("Description").map(cell_text).unwrap_or_default(),
                status: JobStatus::parse(&row.get("Status").map(cell_text).unwrap_or_default()),
            })
            .collect())
    }
}

/// Join container path segments, ignoring empty parents
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}
