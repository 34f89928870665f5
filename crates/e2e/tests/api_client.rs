//! ApiClient against an in-process HTTP stub of the server's JSON endpoints

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Json;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use studyqa_e2e::api::{ApiClient, ControlPlane, FolderType, JobStatus};
use studyqa_e2e::error::E2eError;
use studyqa_e2e::filter::{Filter, FilterOp};
use studyqa_e2e::fixture::{FixtureManager, Freshness};
use studyqa_e2e::server;
use studyqa_e2e::HarnessConfig;

#[derive(Default)]
struct Stub {
    containers: BTreeSet<String>,
    /// (method, container, action, params, authorized)
    requests: Vec<(String, String, String, Vec<(String, String)>, bool)>,
}

type Shared = Arc<Mutex<Stub>>;

async fn handle(
    State(stub): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let path = uri.path().trim_start_matches("/labkey/").replace("%20", " ");
    let mut segments: Vec<&str> = path.split('/').collect();
    let action = segments.pop().unwrap_or_default().to_string();
    let controller = if segments.is_empty() {
        String::new()
    } else {
        segments.remove(0).to_string()
    };
    let container = segments.join("/");
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Basic "))
        .unwrap_or(false);

    let mut stub = stub.lock();
    stub.requests.push((
        method.to_string(),
        container.clone(),
        action.clone(),
        params.clone(),
        authorized,
    ));

    let not_found = |what: &str| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "exception": format!("{what} not found") })),
        )
    };

    match (controller.as_str(), action.as_str()) {
        ("login", "login.view") => (StatusCode::OK, Json(json!({}))),
        ("query", "selectRows.api") => {
            let query = params
                .iter()
                .find(|(k, _)| k == "query.queryName")
                .map(|(_, v)| v.as_str());
            let rows = match query {
                Some("job") => json!([
                    { "RowId": 7, "Description": "Study import: My Study", "Status": "COMPLETE" },
                    { "RowId": 8, "Description": "Specimen import", "Status": "RUNNING" },
                ]),
                _ => json!([{ "SpecimenID": "AssayTestControl1" }, { "SpecimenID": "AssayTestControl2" }]),
            };
            (StatusCode::OK, Json(json!({ "rows": rows, "rowCount": 2 })))
        }
        ("query", "insertRows.api") | ("query", "deleteRows.api") => {
            let affected = body["rows"].as_array().map(Vec::len).unwrap_or_default();
            (StatusCode::OK, Json(json!({ "rowsAffected": affected })))
        }
        ("project", "getContainers.api") => {
            if stub.containers.contains(&container) {
                (StatusCode::OK, Json(json!({ "path": format!("/{container}") })))
            } else {
                not_found(&format!("Folder /{container}"))
            }
        }
        ("core", "createContainer.api") => {
            let name = body["name"].as_str().unwrap_or_default();
            let path = if container.is_empty() {
                name.to_string()
            } else {
                format!("{container}/{name}")
            };
            if !stub.containers.insert(path.clone()) {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "exception": format!("A folder named '{name}' already exists") })),
                );
            }
            (StatusCode::OK, Json(json!({ "path": format!("/{path}") })))
        }
        ("core", "deleteContainer.api") => {
            if stub.containers.remove(&container) {
                let prefix = format!("{container}/");
                stub.containers.retain(|c| !c.starts_with(&prefix));
                (StatusCode::OK, Json(json!({ "success": true })))
            } else {
                not_found(&format!("Folder /{container}"))
            }
        }
        ("security", "deleteUsers.api") => (StatusCode::OK, Json(json!({ "deleted": 0 }))),
        _ => not_found(&path),
    }
}

async fn start_stub() -> (Shared, HarnessConfig) {
    let stub: Shared = Arc::new(Mutex::new(Stub::default()));
    let app = Router::new().fallback(handle).with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = HarnessConfig {
        base_url: format!("http://{addr}/labkey/"),
        username: Some("verifier@studyqa.test".to_string()),
        password: Some("secret".to_string()),
        ..HarnessConfig::default()
    };
    (stub, config)
}

#[tokio::test]
async fn readiness_probe_succeeds_once_the_server_answers() {
    let (_stub, config) = start_stub().await;
    server::wait_until_ready(&config.base_url, Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn select_rows_encodes_filters_as_query_parameters() {
    let (stub, config) = start_stub().await;
    let client = ApiClient::new(&config).unwrap();

    let rows = client
        .select_rows(
            "StudyVerifyProject/My Study",
            "study",
            "SpecimenDetail",
            &[Filter::new("SpecimenID", FilterOp::StartsWith, "AssayTestControl")],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["SpecimenID"], "AssayTestControl1");

    let stub = stub.lock();
    let (method, container, action, params, authorized) = stub.requests.last().unwrap();
    assert_eq!(method, "GET");
    assert_eq!(container, "StudyVerifyProject/My Study");
    assert_eq!(action, "selectRows.api");
    assert!(*authorized);
    assert!(params.contains(&("schemaName".to_string(), "study".to_string())));
    assert!(params.contains(&(
        "query.SpecimenID~startswith".to_string(),
        "AssayTestControl".to_string()
    )));
}

#[tokio::test]
async fn row_changes_report_rows_affected() {
    let (_stub, config) = start_stub().await;
    let client = ApiClient::new(&config).unwrap();
    let mut row = serde_json::Map::new();
    row.insert("ParticipantId".into(), "PT-104".into());

    let inserted = client
        .insert_rows("StudyVerifyProject", "study", "Demographics", vec![row.clone()])
        .await
        .unwrap();
    let deleted = client
        .delete_rows("StudyVerifyProject", "study", "Demographics", vec![row])
        .await
        .unwrap();
    assert_eq!((inserted, deleted), (1, 1));
}

#[tokio::test]
async fn containers_round_trip_and_errors_carry_the_server_message() {
    let (_stub, config) = start_stub().await;
    let client = ApiClient::new(&config).unwrap();

    assert!(!client.container_exists("StudyVerifyProject").await.unwrap());
    let path = client
        .create_container(None, "StudyVerifyProject", FolderType::Study)
        .await
        .unwrap();
    assert_eq!(path, "StudyVerifyProject");
    let child = client
        .create_container(Some("StudyVerifyProject"), "My Study", FolderType::Study)
        .await
        .unwrap();
    assert_eq!(child, "StudyVerifyProject/My Study");
    assert!(client.container_exists("StudyVerifyProject/My Study").await.unwrap());

    let err = client
        .create_container(None, "StudyVerifyProject", FolderType::Study)
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::Api { status: 400, ref message } if message.contains("already exists")));

    client.delete_container("StudyVerifyProject").await.unwrap();
    assert!(!client.container_exists("StudyVerifyProject/My Study").await.unwrap());
    assert!(!client.delete_user("ghost@studyqa.test").await.unwrap());
}

#[tokio::test]
async fn pipeline_jobs_are_read_from_the_job_table() {
    let (_stub, config) = start_stub().await;
    let client = ApiClient::new(&config).unwrap();

    let jobs = client.list_jobs("StudyVerifyProject").await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, "7");
    assert_eq!(jobs[0].status, JobStatus::Complete);
    assert_eq!(jobs[1].status, JobStatus::Running);
}

#[tokio::test]
async fn fixture_manager_recreates_projects_over_http() {
    let (stub, config) = start_stub().await;
    let client: Arc<dyn ControlPlane> = Arc::new(ApiClient::new(&config).unwrap());
    let mut fixtures = FixtureManager::new(client);

    fixtures.create_project("StudyVerifyProject", FolderType::Study).await.unwrap();
    fixtures
        .ensure_project("StudyVerifyProject", FolderType::Study, Freshness::Recreate)
        .await
        .unwrap();
    assert_eq!(fixtures.owned().len(), 1);

    let report = fixtures.teardown().await;
    assert!(report.is_clean());
    assert!(stub.lock().containers.is_empty());
}
