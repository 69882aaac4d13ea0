//! Plugin engine integration tests using inline WAT modules written to disk,
//! the same way operators ship `.wasm` files referenced by `wasm_path`.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;

use agw::dataplane::resources::ResourcePools;
use agw::proto;
use agw::wasm::{PluginEngine, PluginOutcome};

const ALLOW_WAT: &str = r#"
(module
  (func (export "on_request") (result i32)
    i32.const 0))
"#;

const DENY_WAT: &str = r#"
(module
  (func (export "on_request") (result i32)
    i32.const 1))
"#;

/// Denies when the `user-agent` header is present.
const HEADER_WAT: &str = r#"
(module
  (import "env" "agw_get_header" (func $get (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "user-agent")
  (func (export "on_request") (result i32)
    (if (result i32)
      (i32.gt_s
        (call $get (i32.const 0) (i32.const 10) (i32.const 64) (i32.const 64))
        (i32.const 0))
      (then (i32.const 1))
      (else (i32.const 0)))))
"#;

/// Denies when a configuration payload was delivered at instantiation.
const CONFIG_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $len (mut i32) (i32.const 0))
  (func (export "agw_alloc") (param i32) (result i32)
    (i32.const 1024))
  (func (export "agw_on_configure") (param i32 i32)
    (global.set $len (local.get 1)))
  (func (export "on_request") (result i32)
    (if (result i32)
      (i32.gt_s (global.get $len) (i32.const 0))
      (then (i32.const 1))
      (else (i32.const 0)))))
"#;

/// Calls Redis against an unconfigured resource and fails closed on the
/// negative error code.
const REDIS_WAT: &str = r#"
(module
  (import "env" "host_redis_command" (func $redis (param i32 i32 i32 i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "default")
  (data (i32.const 16) "INCR rl:test")
  (func (export "agw_alloc") (param i32) (result i32)
    (i32.const 4096))
  (func (export "on_request") (result i32)
    (if (result i32)
      (i64.lt_s
        (call $redis (i32.const 0) (i32.const 7) (i32.const 16) (i32.const 12))
        (i64.const 0))
      (then (i32.const 1))
      (else (i32.const 0)))))
"#;

/// Logs through the host and allows.
const LOG_WAT: &str = r#"
(module
  (import "env" "agw_log" (func $log (param i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "hello from guest")
  (func (export "on_request") (result i32)
    (call $log (i32.const 2) (i32.const 0) (i32.const 16))
    (i32.const 0)))
"#;

fn engine() -> Arc<PluginEngine> {
    Arc::new(PluginEngine::new(Arc::new(ResourcePools::new())).unwrap())
}

fn write_module(dir: &Path, name: &str, wat: &str) -> String {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(wat.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

fn plugin(name: &str, wasm_path: &str) -> proto::Plugin {
    proto::Plugin {
        name: name.to_string(),
        wasm_path: wasm_path.to_string(),
        config: HashMap::new(),
    }
}

fn cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the duration of the test process.
    std::mem::forget(tx);
    rx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allow_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let allow = write_module(dir.path(), "allow.wat", ALLOW_WAT);
    let log = write_module(dir.path(), "log.wat", LOG_WAT);

    let outcome = engine
        .run_chain(
            &[plugin("allow", &allow), plugin("log", &log)],
            &HashMap::new(),
            cancel(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, PluginOutcome::Allow);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_first_deny_stops_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let allow = write_module(dir.path(), "allow.wat", ALLOW_WAT);
    let deny = write_module(dir.path(), "deny.wat", DENY_WAT);

    let outcome = engine
        .run_chain(
            &[plugin("allow", &allow), plugin("deny", &deny), plugin("after", &allow)],
            &HashMap::new(),
            cancel(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, PluginOutcome::Deny { plugin: "deny".to_string(), code: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_header_visible_to_guest() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let path = write_module(dir.path(), "header.wat", HEADER_WAT);

    let mut headers = HashMap::new();
    headers.insert("user-agent".to_string(), "curl/8.0".to_string());

    let outcome =
        engine.run_chain(&[plugin("ua", &path)], &headers, cancel()).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Deny { .. }));

    let outcome =
        engine.run_chain(&[plugin("ua", &path)], &HashMap::new(), cancel()).await.unwrap();
    assert_eq!(outcome, PluginOutcome::Allow);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_delivered_at_instantiation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let path = write_module(dir.path(), "config.wat", CONFIG_WAT);

    let mut configured = plugin("configured", &path);
    configured.config.insert("limit".to_string(), "5".to_string());

    let outcome =
        engine.run_chain(&[configured], &HashMap::new(), cancel()).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Deny { .. }));

    // Without config the callback never fires and the plugin allows.
    let outcome = engine
        .run_chain(&[plugin("unconfigured", &path)], &HashMap::new(), cancel())
        .await
        .unwrap();
    assert_eq!(outcome, PluginOutcome::Allow);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_redis_resource_surfaces_error_code() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let path = write_module(dir.path(), "redis.wat", REDIS_WAT);

    // No pools configured: the guest sees a negative code and fails closed.
    let outcome =
        engine.run_chain(&[plugin("rate-limit", &path)], &HashMap::new(), cancel()).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Deny { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_export_is_engine_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let path = write_module(dir.path(), "empty.wat", "(module)");

    let result = engine.run_chain(&[plugin("broken", &path)], &HashMap::new(), cancel()).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_failure_poisons_until_recompiled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let path = write_module(dir.path(), "plugin.wat", "(module (this is not wat");

    let snapshot = proto::ConfigSnapshot {
        routes: vec![proto::Route {
            path_prefix: "/x".into(),
            cluster_id: "c1".into(),
            plugins: vec![plugin("p", &path)],
            ..Default::default()
        }],
        ..Default::default()
    };

    engine.preload(&snapshot);
    let result = engine.run_chain(&[plugin("p", &path)], &HashMap::new(), cancel()).await;
    assert!(result.is_err(), "poisoned module must fail the chain");

    // Fix the module on disk; the next snapshot referencing it retries.
    std::fs::write(&path, ALLOW_WAT).unwrap();
    engine.preload(&snapshot);

    let outcome =
        engine.run_chain(&[plugin("p", &path)], &HashMap::new(), cancel()).await.unwrap();
    assert_eq!(outcome, PluginOutcome::Allow);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_file_fails_chain() {
    let engine = engine();
    let result = engine
        .run_chain(&[plugin("ghost", "/nonexistent/plugin.wasm")], &HashMap::new(), cancel())
        .await;
    assert!(result.is_err());
}
