mod common;

use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tuneworker::WorkerConfig;
use tuneworker::fetcher::Fetcher;
use tuneworker::plugin::host::{CapabilityHost, JsonStore};
use tuneworker::plugin::{PluginEvent, PluginRequest, PluginWorker};
use tuneworker::queue::EventSink;

use common::{Route, TestServer, next_event};

/// Guest exercising every capability; each method forwards its raw
/// argument bytes to one host import and returns the envelope unchanged
const PLUGIN: &str = r#"
    (module
      (import "host" "log" (func $log (param i32 i32)))
      (import "host" "http_get" (func $http_get (param i32 i32) (result i64)))
      (import "host" "http_post" (func $http_post (param i32 i32) (result i64)))
      (import "host" "store_get" (func $store_get (param i32 i32) (result i64)))
      (memory (export "memory") 1)
      (global $next (mut i32) (i32.const 1024))
      (func (export "alloc") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $next))
        (global.set $next (i32.add (global.get $next) (local.get $len)))
        (local.get $ptr))
      (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
        (call $log (local.get $ptr) (local.get $len))
        (i64.or
          (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
          (i64.extend_i32_u (local.get $len))))
      (func (export "fetch") (param $ptr i32) (param $len i32) (result i64)
        (call $http_get (local.get $ptr) (local.get $len)))
      (func (export "submit") (param $ptr i32) (param $len i32) (result i64)
        (call $http_post (local.get $ptr) (local.get $len)))
      (func (export "recall") (param $ptr i32) (param $len i32) (result i64)
        (call $store_get (local.get $ptr) (local.get $len)))
      (func (export "crash") (param i32 i32) (result i64)
        unreachable))
"#;

fn spawn(config: &WorkerConfig) -> (PluginWorker, UnboundedReceiver<PluginEvent>) {
    let (events, rx) = EventSink::channel();
    let worker = PluginWorker::spawn(config, events).unwrap();
    (worker, rx)
}

async fn load(worker: &PluginWorker, rx: &mut UnboundedReceiver<PluginEvent>) -> Vec<String> {
    worker
        .handle_message(PluginRequest::LoadPlugin {
            source: PLUGIN.to_string(),
        })
        .unwrap();
    match next_event(rx).await {
        PluginEvent::LoadDone { methods } => methods,
        other => panic!("expected LOAD_DONE, got {:?}", other),
    }
}

fn call(worker: &PluginWorker, id: &str, method: &str, args: Value) {
    worker
        .handle_message(PluginRequest::CallMethod {
            id: id.to_string(),
            method: method.to_string(),
            args,
        })
        .unwrap();
}

/// Skip log lines and return the call's outcome
async fn call_result(rx: &mut UnboundedReceiver<PluginEvent>) -> (String, Option<Value>, Option<String>) {
    loop {
        match next_event(rx).await {
            PluginEvent::CallResult { id, result, error } => return (id, result, error),
            PluginEvent::Log { .. } => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_reports_methods_and_echo_round_trips() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    let methods = load(&worker, &mut rx).await;
    assert_eq!(methods, vec!["crash", "echo", "fetch", "recall", "submit"]);

    call(&worker, "c1", "echo", json!({"query": "blue"}));
    assert_eq!(
        next_event(&mut rx).await,
        PluginEvent::Log {
            message: r#"{"query":"blue"}"#.to_string()
        }
    );
    let (id, result, error) = call_result(&mut rx).await;
    assert_eq!(id, "c1");
    assert_eq!(result, Some(json!({"query": "blue"})));
    assert_eq!(error, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_errors_are_reported_and_worker_survives() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    load(&worker, &mut rx).await;

    call(&worker, "c1", "nope", Value::Null);
    let (id, result, error) = call_result(&mut rx).await;
    assert_eq!(id, "c1");
    assert_eq!(result, None);
    assert!(error.unwrap().contains("method not found"));

    call(&worker, "c2", "crash", Value::Null);
    let (id, _, error) = call_result(&mut rx).await;
    assert_eq!(id, "c2");
    assert!(error.is_some());

    call(&worker, "c3", "echo", json!(7));
    let (_, result, _) = call_result(&mut rx).await;
    assert_eq!(result, Some(json!(7)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_before_load_is_an_error() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    call(&worker, "c1", "echo", Value::Null);
    let (_, _, error) = call_result(&mut rx).await;
    assert_eq!(error.as_deref(), Some("no plugin loaded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_source_reports_error() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    worker
        .handle_message(PluginRequest::LoadPlugin {
            source: "(module (func".to_string(),
        })
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        PluginEvent::Error { id: None, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_get_round_trip() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    load(&worker, &mut rx).await;

    call(&worker, "c1", "fetch", json!("https://music.example/search?q=x"));
    let request_id = match next_event(&mut rx).await {
        PluginEvent::HttpRequest { id, method, url, body } => {
            assert_eq!(method, "GET");
            assert_eq!(url, "https://music.example/search?q=x");
            assert_eq!(body, None);
            id
        }
        other => panic!("expected HTTP_REQUEST, got {:?}", other),
    };
    assert!(worker.pending().contains(&request_id));

    worker
        .handle_message(PluginRequest::HttpResponse {
            id: request_id,
            data: Some(json!({"songs": [1, 2]})),
            error: None,
        })
        .unwrap();

    let (id, result, error) = call_result(&mut rx).await;
    assert_eq!(id, "c1");
    assert_eq!(error, None);
    assert_eq!(result, Some(json!({"ok": {"songs": [1, 2]}})));
    assert!(worker.pending().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_error_response_reaches_plugin() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    load(&worker, &mut rx).await;

    call(
        &worker,
        "c1",
        "submit",
        json!({"url": "https://music.example/like", "body": {"id": 3}}),
    );
    let request_id = match next_event(&mut rx).await {
        PluginEvent::HttpRequest { id, method, body, .. } => {
            assert_eq!(method, "POST");
            assert_eq!(body, Some(json!({"id": 3})));
            id
        }
        other => panic!("expected HTTP_REQUEST, got {:?}", other),
    };

    worker
        .handle_message(PluginRequest::HttpResponse {
            id: request_id,
            data: None,
            error: Some("forbidden".to_string()),
        })
        .unwrap();

    let (_, result, _) = call_result(&mut rx).await;
    assert_eq!(result, Some(json!({"err": "forbidden"})));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unanswered_request_times_out() {
    let config = WorkerConfig {
        plugin_request_timeout_secs: 1,
        ..WorkerConfig::default()
    };
    let (worker, mut rx) = spawn(&config);
    load(&worker, &mut rx).await;

    call(&worker, "c1", "fetch", json!("https://music.example/slow"));
    let request_id = match next_event(&mut rx).await {
        PluginEvent::HttpRequest { id, .. } => id,
        other => panic!("expected HTTP_REQUEST, got {:?}", other),
    };

    let (_, result, error) = call_result(&mut rx).await;
    assert_eq!(error, None);
    let result = result.unwrap();
    assert!(result["err"].as_str().unwrap().contains("timed out"));
    assert!(worker.pending().is_empty());

    // The late answer is dropped and the worker keeps serving
    worker
        .handle_message(PluginRequest::HttpResponse {
            id: request_id,
            data: Some(json!("late")),
            error: None,
        })
        .unwrap();
    call(&worker, "c2", "echo", json!("still here"));
    let (id, result, _) = call_result(&mut rx).await;
    assert_eq!(id, "c2");
    assert_eq!(result, Some(json!("still here")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_get_round_trip() {
    let (worker, mut rx) = spawn(&WorkerConfig::default());
    load(&worker, &mut rx).await;

    call(&worker, "c1", "recall", json!("token"));
    let request_id = match next_event(&mut rx).await {
        PluginEvent::StoreRequest { id, key } => {
            assert_eq!(key, "token");
            id
        }
        other => panic!("expected STORE_REQUEST, got {:?}", other),
    };
    worker
        .handle_message(PluginRequest::StoreResponse {
            id: request_id,
            value: json!("abc"),
        })
        .unwrap();

    let (_, result, _) = call_result(&mut rx).await;
    assert_eq!(result, Some(json!({"ok": "abc"})));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capability_host_answers_plugin_requests() {
    let server = TestServer::start(vec![(
        "/search",
        Route::ok("application/json", br#"{"hits":3}"#.to_vec()),
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let config = WorkerConfig::default();
    let host = CapabilityHost::new(
        Fetcher::new(&config).unwrap(),
        JsonStore::open(&dir.path().join("store.json")).unwrap(),
    );

    let (worker, mut rx) = spawn(&config);
    load(&worker, &mut rx).await;
    call(&worker, "c1", "fetch", json!(server.url("/search")));

    let result = loop {
        match next_event(&mut rx).await {
            PluginEvent::CallResult { result, .. } => break result,
            event => {
                if let Some(response) = host.answer(&event).await {
                    worker.handle_message(response).unwrap();
                }
            }
        }
    };

    assert_eq!(result, Some(json!({"ok": {"hits": 3}})));
    assert_eq!(server.count("GET /search"), 1);
}
