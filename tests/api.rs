//! End-to-end API scenarios through the full router: authentication,
//! namespace isolation, validation reporting and cascade deletion.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::{Extension, Router};
use tower::ServiceExt;

use devnet_builder::api;
use devnet_builder::auth::{ConnKind, CredentialStore};
use devnet_builder::controller::{BroadcastHub, ControllerState};
use devnet_builder::logs::LogManager;
use devnet_builder::plugin::{PluginRegistry, StablePlugin};
use devnet_builder::resources::{
    Devnet, DevnetSpec, Node, NodeRole, NodeSpec, Upgrade, UpgradeSpec,
};
use devnet_builder::runtime::{DockerRuntime, ProcessRuntime, RuntimeSelector, ServiceRuntime};
use devnet_builder::store::Store;

struct Fixture {
    _dir: tempfile::TempDir,
    state: Arc<ControllerState>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("state.redb")).unwrap());
        let credentials =
            Arc::new(CredentialStore::load(&dir.path().join("api-keys.yaml")).unwrap());
        let logs = Arc::new(LogManager::new(&dir.path().join("logs"), 1024 * 1024, 3));
        let plugins = Arc::new(PluginRegistry::default());
        plugins.register(Arc::new(StablePlugin::default()));
        let process = Arc::new(ProcessRuntime::new(logs.clone()));
        let runtimes = Arc::new(RuntimeSelector {
            process,
            service: Arc::new(ServiceRuntime::new(logs.clone())),
            docker: Arc::new(DockerRuntime::new().unwrap()),
        });
        let state = Arc::new(ControllerState {
            store,
            credentials,
            plugins,
            runtimes,
            logs,
            data_dir: dir.path().to_path_buf(),
            provision_logs: BroadcastHub::default(),
        });
        Self { _dir: dir, state }
    }

    /// Router as seen by remote TCP clients.
    fn remote(&self) -> Router {
        api::router(self.state.clone()).layer(Extension(ConnKind::Remote))
    }

    /// Router as seen over the local unix socket.
    fn local(&self) -> Router {
        api::router(self.state.clone()).layer(Extension(ConnKind::Local))
    }

    fn token(&self, name: &str, namespaces: &[&str]) -> String {
        self.state
            .credentials
            .create(name, namespaces.iter().map(|s| s.to_string()).collect())
            .unwrap()
            .key
    }
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn create_devnet_request(token: Option<&str>, namespace: &str, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/devnets")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let mut body = body;
    body["namespace"] = serde_json::Value::String(namespace.to_string());
    builder.body(Body::from(body.to_string())).unwrap()
}

fn d1_body() -> serde_json::Value {
    serde_json::json!({
        "name": "d1",
        "spec": {
            "plugin": "stable",
            "validators": 2,
            "fullNodes": 1,
            "mode": "docker"
        }
    })
}

#[tokio::test]
async fn scoped_credential_creates_devnet_in_its_namespace() {
    let fx = Fixture::new();
    let token = fx.token("alice", &["team-a"]);

    let (status, body) = send(
        fx.remote(),
        create_devnet_request(Some(&token), "team-a", d1_body()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["meta"]["namespace"], "team-a");
    assert_eq!(body["status"]["phase"], "Pending");

    let stored: Devnet = fx.state.store.get("team-a", "d1").unwrap();
    assert_eq!(stored.spec.validators, 2);
    assert_eq!(stored.meta.generation, 1);
}

#[tokio::test]
async fn wrong_namespace_scope_is_permission_denied() {
    let fx = Fixture::new();
    let token = fx.token("bob", &["team-b"]);

    let (status, _) = send(
        fx.remote(),
        create_devnet_request(Some(&token), "team-a", d1_body()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invalid_mode_reports_field_path() {
    let fx = Fixture::new();
    let token = fx.token("alice", &["team-a"]);
    let mut body = d1_body();
    body["spec"]["mode"] = serde_json::Value::String("invalid".to_string());

    let (status, body) = send(
        fx.remote(),
        create_devnet_request(Some(&token), "team-a", body),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("spec.mode"));
}

#[tokio::test]
async fn upgrade_with_unknown_devnet_reports_ref_not_found() {
    let fx = Fixture::new();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/upgrades")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "name": "u1",
                "namespace": "default",
                "spec": {
                    "devnetRef": "nonexistent",
                    "upgradeName": "v2"
                }
            })
            .to_string(),
        ))
        .unwrap();

    let (status, body) = send(fx.local(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("spec.devnet_ref"));
    assert!(message.contains("not_found"));
}

#[tokio::test]
async fn authentication_failures_share_one_message() {
    let fx = Fixture::new();

    let cases: Vec<Option<String>> = vec![
        None,
        Some("Basic dXNlcjpwYXNz".to_string()),
        Some("Bearer not-a-token".to_string()),
        Some("Bearer devnet_0123456789abcdef0123456789abcdef".to_string()),
    ];
    for case in cases {
        let mut builder = Request::builder().method("GET").uri("/v1/devnets");
        if let Some(value) = &case {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let (status, body) = send(fx.remote(), builder.body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "case {case:?}");
        assert_eq!(body["message"], "authentication failed", "case {case:?}");
    }
}

#[tokio::test]
async fn namespace_isolation_for_reads_and_wildcard_override() {
    let fx = Fixture::new();
    fx.state
        .store
        .create(Devnet::new("d1", "team-a", DevnetSpec::default()))
        .unwrap();
    fx.state
        .store
        .create(Devnet::new("d2", "team-b", DevnetSpec::default()))
        .unwrap();

    let scoped = fx.token("alice", &["team-a"]);
    let admin = fx.token("root", &["*"]);

    let list = |token: String, ns: &str| {
        let request = Request::builder()
            .method("GET")
            .uri(format!("/v1/devnets?namespace={ns}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        send(fx.remote(), request)
    };

    let (status, body) = list(scoped.clone(), "team-a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    let (status, _) = list(scoped.clone(), "team-b").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = list(admin.clone(), "team-a").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = list(admin, "team-b").await;
    assert_eq!(status, StatusCode::OK);

    // Get and delete are equally scoped.
    let request = Request::builder()
        .method("GET")
        .uri("/v1/devnets/team-b/d2")
        .header(header::AUTHORIZATION, format!("Bearer {scoped}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(fx.remote(), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn cascade_delete_removes_children_and_is_idempotent() {
    let fx = Fixture::new();
    fx.state
        .store
        .create(Devnet::new(
            "d1",
            "default",
            DevnetSpec {
                plugin: "stable".to_string(),
                validators: 2,
                ..Default::default()
            },
        ))
        .unwrap();
    for index in 0..2u32 {
        fx.state
            .store
            .create(Node::new(
                &format!("d1-node-{index}"),
                "default",
                NodeSpec {
                    devnet_ref: "d1".to_string(),
                    namespace_ref: "default".to_string(),
                    index,
                    role: NodeRole::Validator,
                    home_dir: format!("/tmp/d1/node{index}"),
                    ..Default::default()
                },
            ))
            .unwrap();
    }
    fx.state
        .store
        .create(Upgrade::new(
            "u1",
            "default",
            UpgradeSpec {
                devnet_ref: "d1".to_string(),
                upgrade_name: "v2".to_string(),
                ..Default::default()
            },
        ))
        .unwrap();

    let delete = || {
        let request = Request::builder()
            .method("DELETE")
            .uri("/v1/devnets/default/d1")
            .body(Body::empty())
            .unwrap();
        send(fx.local(), request)
    };

    let (status, _) = delete().await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert!(fx
        .state
        .store
        .list_nodes_by_devnet("default", "d1")
        .unwrap()
        .is_empty());
    assert!(fx
        .state
        .store
        .list_upgrades_by_devnet("default", "d1")
        .unwrap()
        .is_empty());

    let request = Request::builder()
        .method("GET")
        .uri("/v1/devnets/default/d1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(fx.local(), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Deleting again reports the missing parent.
    let (status, _) = delete().await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stale_generation_update_conflicts() {
    let fx = Fixture::new();
    fx.state
        .store
        .create(Devnet::new(
            "d1",
            "default",
            DevnetSpec {
                plugin: "stable".to_string(),
                ..Default::default()
            },
        ))
        .unwrap();

    let patch = |generation: i64, full_nodes: u32| {
        let request = Request::builder()
            .method("PATCH")
            .uri("/v1/devnets/default/d1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "generation": generation,
                    "spec": { "fullNodes": full_nodes }
                })
                .to_string(),
            ))
            .unwrap();
        send(fx.local(), request)
    };

    let (status, body) = patch(1, 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["generation"], 2);

    // Second writer still holds generation 1.
    let (status, _) = patch(1, 2).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let stored: Devnet = fx.state.store.get("default", "d1").unwrap();
    assert_eq!(stored.meta.generation, 2);
    assert_eq!(stored.spec.full_nodes, 1);
}

#[tokio::test]
async fn default_namespace_applied_at_ingress() {
    let fx = Fixture::new();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/devnets")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(d1_body().to_string()))
        .unwrap();

    let (status, body) = send(fx.local(), request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["meta"]["namespace"], "default");
}

#[tokio::test]
async fn credential_management_requires_wildcard_authority() {
    let fx = Fixture::new();
    let scoped = fx.token("alice", &["team-a"]);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/credentials")
        .header(header::AUTHORIZATION, format!("Bearer {scoped}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({"name": "eve", "namespaces": ["*"]}).to_string(),
        ))
        .unwrap();
    let (status, _) = send(fx.remote(), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The local socket mints freely.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/credentials")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({"name": "ci", "namespaces": ["team-a"]}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(fx.local(), request).await;
    assert_eq!(status, StatusCode::CREATED);
    let key = body["key"].as_str().unwrap();
    assert!(key.starts_with("devnet_"));
    assert_eq!(key.len(), 39);
}
