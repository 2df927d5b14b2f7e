#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chainward_kernel::config::{self, FailureMode};

const BASE: &str = r#"
version: 1
engine:
  on_missing_route: fail_closed
  on_policy_error: fail_open
  inflight_ttl_ms: 30000
"#;

fn err_of(yaml: &str) -> String {
    config::load_from_str(yaml).unwrap_err().to_string()
}

#[test]
fn minimal_config_applies_defaults() {
    let cfg = config::load_from_str(BASE).unwrap();
    assert_eq!(cfg.server.listen, "0.0.0.0:9001");
    assert_eq!(cfg.engine.on_missing_route, FailureMode::FailClosed);
    assert_eq!(cfg.engine.on_policy_error, FailureMode::FailOpen);
    assert_eq!(cfg.engine.route_metadata_namespace, "chainward");
    assert_eq!(cfg.engine.route_key_field, "route_key");
    assert_eq!(cfg.engine.policy_timeout_ms, 2000);
    assert_eq!(cfg.distribution.node_id, "chainward");
    assert!(cfg.distribution.resource_names.is_empty());
    assert!(cfg.policies.definitions_dir.is_none());
}

#[test]
fn failure_modes_have_no_default() {
    let yaml = "version: 1\nengine:\n  on_policy_error: fail_open\n  inflight_ttl_ms: 30000\n";
    assert!(err_of(yaml).contains("on_missing_route"));

    let yaml = "version: 1\nengine:\n  on_missing_route: fail_open\n  on_policy_error: fail_open\n";
    assert!(err_of(yaml).contains("inflight_ttl_ms"));
}

#[test]
fn unknown_fields_are_rejected() {
    let yaml = format!("{BASE}  retries: 3\n");
    assert!(config::load_from_str(&yaml).is_err());

    let yaml = format!("{BASE}telemetry:\n  enabled: true\n");
    assert!(config::load_from_str(&yaml).is_err());
}

#[test]
fn unknown_failure_mode_is_rejected() {
    let yaml = BASE.replace("fail_open", "ignore");
    assert!(config::load_from_str(&yaml).is_err());
}

#[test]
fn ranges_are_checked() {
    let yaml = BASE.replace("30000", "10");
    assert!(err_of(&yaml).contains("inflight_ttl_ms"));

    let yaml = format!("{BASE}  sweep_interval_ms: 30000\n");
    assert!(err_of(&yaml).contains("sweep_interval_ms"));

    let yaml = format!("{BASE}  policy_timeout_ms: 0\n");
    assert!(err_of(&yaml).contains("policy_timeout_ms"));

    let yaml = BASE.replace("version: 1", "version: 2");
    assert!(err_of(&yaml).contains("version"));

    let yaml = format!("{BASE}server:\n  listen: not-an-address\n");
    assert!(err_of(&yaml).contains("server.listen"));
}

#[test]
fn reload_intervals_need_a_source() {
    let yaml = format!("{BASE}distribution:\n  reload_interval_ms: 1000\n");
    assert!(err_of(&yaml).contains("routes_file"));

    let yaml = format!("{BASE}policies:\n  reload_interval_ms: 1000\n");
    assert!(err_of(&yaml).contains("definitions_dir"));

    let yaml = format!("{BASE}policies:\n  definitions_dir: ./policies\n  reload_interval_ms: 50\n");
    assert!(err_of(&yaml).contains("reload_interval_ms"));

    let yaml = format!("{BASE}policies:\n  definitions_dir: ./policies\n  reload_interval_ms: 500\n");
    let cfg = config::load_from_str(&yaml).unwrap();
    assert_eq!(cfg.policies.reload_interval_ms, 500);
}

#[test]
fn routes_file_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yaml");
    std::fs::write(
        &path,
        "routes:\n  - route_key: orders\n  - route_key: orders\n",
    )
    .unwrap();
    let err = config::load_routes_file(&path).unwrap_err();
    assert!(err.to_string().contains("duplicate route_key"));

    std::fs::write(
        &path,
        "routes:\n  - route_key: orders\n    request_policies:\n      - name: set-header\n        parameters: { name: x-a, value: b }\n",
    )
    .unwrap();
    let routes = config::load_routes_file(&path).unwrap();
    assert_eq!(routes.routes.len(), 1);
    assert_eq!(routes.routes[0].request_policies[0].name, "set-header");
}
