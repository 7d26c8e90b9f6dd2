//! Convergence runs in mock mode against a recording host
//!
//! The host records every operation so the tests can check exactly what a
//! run would have done to the machine.

use anyhow::Result;
use cmagent::config::NodeAttributes;
use cmagent::converge::{AgentStatus, Converger, ProvisionState, AGENT_CONFIG_PATH};
use cmagent::error::ProvisionError;
use cmagent::host::{
    Change, Host, PackageVersion, Platform, Repository, ServiceAction, TemplateRequest,
};
use cmagent::monitoring::{Credentials, MockFixture, MonitoringClient};
use cmagent::provision;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Repository(String),
    Package(String, PackageVersion),
    Service(String, Vec<ServiceAction>),
    Template(PathBuf, u32, Vec<(String, String)>),
    Directory(PathBuf, u32),
    Sync(PathBuf, PathBuf),
}

/// Host that records operations and reports every template render as a change
#[derive(Default)]
struct RecordingHost {
    ops: Mutex<Vec<Op>>,
}

impl RecordingHost {
    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    fn touched_agent(&self) -> bool {
        self.ops()
            .iter()
            .any(|op| matches!(op, Op::Template(..) | Op::Package(..) | Op::Service(..)))
    }
}

impl Host for RecordingHost {
    async fn add_repository(&self, repository: &Repository) -> Result<Change> {
        self.record(Op::Repository(repository.name().to_string()));
        Ok(Change::Unchanged)
    }

    async fn install_package(&self, name: &str, version: &PackageVersion) -> Result<Change> {
        self.record(Op::Package(name.to_string(), version.clone()));
        Ok(Change::Unchanged)
    }

    async fn manage_service(&self, name: &str, actions: &[ServiceAction]) -> Result<Change> {
        self.record(Op::Service(name.to_string(), actions.to_vec()));
        Ok(Change::Unchanged)
    }

    async fn render_template(&self, request: &TemplateRequest) -> Result<Change> {
        let variables = request
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.record(Op::Template(request.destination.clone(), request.mode, variables));
        Ok(Change::Changed)
    }

    async fn ensure_directory(&self, path: &Path, mode: u32) -> Result<Change> {
        self.record(Op::Directory(path.to_path_buf(), mode));
        Ok(Change::Unchanged)
    }

    async fn sync_directory(&self, source: &Path, destination: &Path, _file_mode: u32) -> Result<Change> {
        self.record(Op::Sync(source.to_path_buf(), destination.to_path_buf()));
        Ok(Change::Unchanged)
    }
}

fn ubuntu() -> Platform {
    Platform::from_os_release("ID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n", "x86_64")
}

fn mock_client(fixture: &MockFixture) -> MonitoringClient {
    MonitoringClient::with_fixture(Credentials::mock("Mr. Mockson"), fixture.clone())
}

fn node_named(hostname: &str) -> NodeAttributes {
    NodeAttributes::from_value(json!({"hostname": hostname}))
}

fn rendered_values(host: &RecordingHost) -> Option<Vec<(String, String)>> {
    host.ops().into_iter().find_map(|op| match op {
        Op::Template(_, _, vars) => Some(vars),
        _ => None,
    })
}

fn config_vars(id: &str, token: &str) -> Vec<(String, String)> {
    vec![
        ("monitoring_id".to_string(), id.to_string()),
        ("monitoring_token".to_string(), token.to_string()),
    ]
}

#[tokio::test]
async fn test_mock_run_creates_token_for_hostname() {
    let fixture = MockFixture::new();
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("node1");

    let report = Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();

    let token = node.agent_token().expect("token recorded").to_string();
    assert_eq!(node.agent_id(), Some("node1"));
    assert_eq!(report.agent, AgentStatus::Configured { id: "node1".to_string() });
    assert!(report.provisioned);
    assert_eq!(fixture.create_calls(), 1);
    assert_eq!(fixture.objects("agent_tokens")[0]["label"], "node1");

    assert_eq!(rendered_values(&host), Some(config_vars("node1", &token)));
}

#[tokio::test]
async fn test_resolved_node_makes_no_remote_calls() {
    let fixture = MockFixture::new();
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("node1");
    node.set_agent_token("t1");
    node.set_agent_id("e1");

    let report = Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();

    assert!(!report.provisioned);
    assert_eq!(fixture.list_calls(), 0);
    assert_eq!(fixture.create_calls(), 0);
    assert_eq!(rendered_values(&host), Some(config_vars("e1", "t1")));
}

#[tokio::test]
async fn test_token_label_becomes_agent_id() {
    let fixture = MockFixture::new().with_object(
        "agent_tokens",
        json!({"id": "abc123", "label": "host-42", "token": "abc123"}),
    );
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("host-42");

    Converger::new(&client, &host, ubuntu())
        .provision(&mut node)
        .await
        .unwrap();

    assert_eq!(node.agent_id(), Some("host-42"));
    assert_eq!(node.agent_token(), Some("abc123"));
    assert_eq!(fixture.create_calls(), 0);
    assert!(host.ops().is_empty());
}

#[tokio::test]
async fn test_stale_token_reuses_labelled_token() {
    let fixture = MockFixture::new().with_object(
        "agent_tokens",
        json!({"id": "real", "label": "node1", "token": "real"}),
    );
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("node1");
    node.set_agent_token("stale");

    let state = Converger::new(&client, &host, ubuntu())
        .provision(&mut node)
        .await
        .unwrap();

    assert_eq!(
        state,
        ProvisionState::Resolved {
            token: "real".to_string(),
            id: "node1".to_string()
        }
    );
    assert_eq!(fixture.create_calls(), 0);
    assert_eq!(fixture.objects("agent_tokens").len(), 1);
}

#[tokio::test]
async fn test_unlabelled_token_in_listing_is_tolerated() {
    let fixture = MockFixture::new()
        .with_object("agent_tokens", json!({"id": "x", "label": null, "token": "x"}));
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("node1");

    let report = Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();

    assert_eq!(report.agent, AgentStatus::Configured { id: "node1".to_string() });
    assert_eq!(fixture.create_calls(), 1);
}

#[tokio::test]
async fn test_incomplete_provisioning_skips_agent() {
    // A token the API returns without a usable secret
    let fixture = MockFixture::new().with_object(
        "agent_tokens",
        json!({"id": "", "label": "node1", "token": ""}),
    );
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("node1");

    let report = Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();

    assert!(matches!(report.agent, AgentStatus::Skipped { .. }));
    assert!(!host.touched_agent());

    // Repository and plugin directory are still managed
    let ops = host.ops();
    assert!(ops.contains(&Op::Repository("cloud-monitoring".to_string())));
    assert!(ops
        .iter()
        .any(|op| matches!(op, Op::Directory(_, 0o755))));
}

#[tokio::test]
async fn test_api_failure_aborts_before_touching_agent() {
    // Live mode without a username or key cannot authenticate
    let client = MonitoringClient::new(Credentials::mock("nobody").with_mock(false)).unwrap();
    let host = RecordingHost::default();
    let mut node = node_named("node1");

    let err = Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::Configuration(_))
    ));
    assert!(!host.touched_agent());
    assert!(node.agent_token().is_none());
}

#[tokio::test]
async fn test_second_run_reuses_token() {
    let fixture = MockFixture::new();
    let client = mock_client(&fixture);
    let host = RecordingHost::default();
    let mut node = node_named("node1");

    let converger = Converger::new(&client, &host, ubuntu());
    converger.converge(&mut node).await.unwrap();
    let first_token = node.agent_token().map(str::to_string);

    let second = converger.converge(&mut node).await.unwrap();

    assert!(!second.provisioned);
    assert_eq!(node.agent_token().map(str::to_string), first_token);
    assert_eq!(fixture.create_calls(), 1);
}

#[tokio::test]
async fn test_config_change_restarts_service_and_pins_version() {
    let client = mock_client(&MockFixture::new());
    let host = RecordingHost::default();
    let mut node = NodeAttributes::from_value(json!({
        "hostname": "node1",
        "rackspace_cloudmonitoring": {
            "config": {"agent": {"token": "t1", "id": "e1"}},
            "agent": {"version": "0.2.2-1"}
        }
    }));

    let report = Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();

    let ops = host.ops();
    assert!(ops.contains(&Op::Template(PathBuf::from(AGENT_CONFIG_PATH), 0o600, config_vars("e1", "t1"))));
    assert!(ops.contains(&Op::Package(
        "rackspace-monitoring-agent".to_string(),
        PackageVersion::Pinned("0.2.2-1".to_string())
    )));
    assert!(ops.contains(&Op::Service(
        "rackspace-monitoring-agent".to_string(),
        vec![ServiceAction::Enable, ServiceAction::Start, ServiceAction::Restart]
    )));
    assert!(report
        .changes
        .contains(&format!("template[{}]", AGENT_CONFIG_PATH)));
}

#[tokio::test]
async fn test_plugins_are_synced_into_plugin_path() {
    let client = mock_client(&MockFixture::new());
    let host = RecordingHost::default();
    let mut node = NodeAttributes::from_value(json!({
        "hostname": "node1",
        "rackspace_cloudmonitoring": {
            "config": {"agent": {"token": "t1", "id": "e1"}},
            "agent": {
                "plugin_path": "/opt/plugins",
                "plugins": {"/srv/cookbooks/web": "files/plugins"}
            }
        }
    }));

    Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();

    let ops = host.ops();
    assert!(ops.contains(&Op::Directory(PathBuf::from("/opt/plugins"), 0o755)));
    assert!(ops.contains(&Op::Sync(
        PathBuf::from("/srv/cookbooks/web/files/plugins"),
        PathBuf::from("/opt/plugins")
    )));
}

#[tokio::test]
async fn test_unknown_platform_skips_repository() {
    let client = mock_client(&MockFixture::new());
    let host = RecordingHost::default();
    let mut node = node_named("node1");
    node.set_agent_token("t1");
    node.set_agent_id("e1");

    let platform = Platform::from_os_release("ID=alpine\n", "x86_64");
    Converger::new(&client, &host, platform)
        .converge(&mut node)
        .await
        .unwrap();

    assert!(!host.ops().iter().any(|op| matches!(op, Op::Repository(_))));
    assert!(host.touched_agent());
}

#[tokio::test]
async fn test_get_or_create_twice_creates_once() {
    let credentials = Credentials::mock("idempotence-check");

    let first = provision::get_or_create_token(Some(&credentials), "node1").await.unwrap();
    let second = provision::get_or_create_token(Some(&credentials), "node1").await.unwrap();
    assert_eq!(first.token, second.token);

    let entity_a = provision::get_or_create_entity(Some(&credentials), "web01").await.unwrap();
    let entity_b = provision::get_or_create_entity(Some(&credentials), "web01").await.unwrap();
    assert_eq!(entity_a.id, entity_b.id);

    assert_eq!(MockFixture::shared("idempotence-check").create_calls(), 2);
}

#[tokio::test]
async fn test_nil_credentials_rejected() {
    let err = provision::get_or_create_token(None, "node1").await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidCredentials(_)));
}

#[tokio::test]
async fn test_attributes_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.yaml");

    let client = mock_client(&MockFixture::new());
    let host = RecordingHost::default();

    let mut node = NodeAttributes::load(&path).unwrap();
    node.set("hostname", "node1");
    Converger::new(&client, &host, ubuntu())
        .converge(&mut node)
        .await
        .unwrap();
    node.save().unwrap();

    let reloaded = NodeAttributes::load(&path).unwrap();
    assert_eq!(reloaded.agent_id(), Some("node1"));
    assert_eq!(reloaded.agent_token(), node.agent_token());
}
