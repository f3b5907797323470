//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tower::ServiceExt;
use vireo_datastore::{
    Datastore, DatastoreEngine, DatastoreHandle, EngineConfig,
};
use vireo_restconf::auth::{Authenticator, Error as AuthError};
use vireo_restconf::{Server, ServerOptions};
use yang3::data::{
    Data, DataFormat, DataOperation, DataParserFlags, DataTree,
    DataValidationFlags,
};

struct TestServer {
    router: Router,
    handle: DatastoreHandle,
    _shutdown: broadcast::Sender<()>,
}

struct MockAuth;

impl Authenticator for MockAuth {
    fn authenticate(
        &self,
        username: &str,
        password: &str,
        _remote_host: Option<&str>,
    ) -> Result<String, AuthError> {
        match (username, password) {
            ("alice", "secret") | ("bob", "builder") | ("root", "toor") => {
                Ok(username.to_owned())
            }
            _ => Err(AuthError::new("Authentication failed")),
        }
    }
}

fn start(options: ServerOptions) -> TestServer {
    let config = EngineConfig {
        yang_search_dirs: vec![format!(
            "{}/../vireo-datastore/tests/yang",
            env!("CARGO_MANIFEST_DIR")
        )],
        yang_modules: vec!["example".to_owned()],
        ..Default::default()
    };
    let (mut engine, handle, nacm_rx) = DatastoreEngine::init(config);

    engine.register_rpc("/example:test-rpc", |ctx, input| {
        let input = input
            .find_path("/example:test-rpc/i")
            .ok()
            .and_then(|dnode| dnode.value_canonical())
            .unwrap_or_default();
        let mut output = DataTree::new(ctx);
        output
            .new_path(
                "/example:test-rpc/out1",
                Some(&format!("{}!", input)),
                true,
            )
            .map_err(vireo_datastore::Error::YangInternal)?;
        output
            .new_path("/example:test-rpc/out2", Some("done"), true)
            .map_err(vireo_datastore::Error::YangInternal)?;
        Ok(output)
    });

    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(engine.run(shutdown_tx.subscribe()));

    let server = Server::new(
        handle.clone(),
        nacm_rx,
        Some(Arc::new(MockAuth)),
        options,
    );
    TestServer {
        router: server.router(),
        handle,
        _shutdown: shutdown_tx,
    }
}

fn basic(user: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", user, password))
    )
}

fn request(
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder
        .body(match body {
            Some(body) => Body::from(body.to_owned()),
            None => Body::empty(),
        })
        .unwrap();
    let addr: SocketAddr = "127.0.0.1:45678".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn send(
    server: &TestServer,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> Response<Body> {
    server
        .router
        .clone()
        .oneshot(request(method, uri, headers, body))
        .await
        .unwrap()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn next_sse_frame(body: &mut Body) -> Option<String> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("timed out waiting for an SSE frame")?;
        let frame = frame.unwrap();
        if let Ok(data) = frame.into_data() {
            let frame = String::from_utf8(data.to_vec()).unwrap();
            // Skip keep-alive comments.
            if frame.starts_with(':') {
                continue;
            }
            return Some(frame);
        }
    }
}

fn parse_op(
    handle: &DatastoreHandle,
    json: &str,
    operation: DataOperation,
) -> DataTree<'static> {
    DataTree::parse_op_string(
        handle.context(),
        json,
        DataFormat::JSON,
        operation,
    )
    .unwrap()
}

async fn configure_nacm(handle: &DatastoreHandle) {
    let nacm = r#"{"ietf-netconf-acm:nacm":{
        "enable-nacm":true,
        "groups":{"group":[
            {"name":"yangnobody","user-name":["yangnobody"]},
            {"name":"users","user-name":["alice","bob"]}]},
        "rule-list":[
            {"name":"anon","group":["yangnobody"],"rule":[
                {"name":"read-example","module-name":"example",
                 "access-operations":"read","action":"permit"},
                {"name":"deny-rest","module-name":"*",
                 "access-operations":"*","action":"deny"}]},
            {"name":"users","group":["users"],"rule":[
                {"name":"permit-all","module-name":"*",
                 "access-operations":"*","action":"permit"}]}]}}"#;
    let tree = DataTree::parse_string(
        handle.context(),
        nacm,
        DataFormat::JSON,
        DataParserFlags::empty(),
        DataValidationFlags::NO_STATE | DataValidationFlags::PRESENT,
    )
    .unwrap();
    handle
        .session("root")
        .merge(Datastore::Running, tree)
        .await
        .unwrap();
    // Give the policy watcher a moment to pick up the change.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ===== tests =====

#[tokio::test]
async fn unauthenticated_request_is_denied() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a",
        &[],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_string(response).await;
    assert!(body.contains("ietf-restconf:errors"));
    assert!(body.contains("access-denied"));
}

#[tokio::test]
async fn bad_credentials_are_denied() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a",
        &[("authorization", &basic("alice", "wrong"))],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn anonymous_access_with_valid_rules() {
    let server = start(ServerOptions::default());
    configure_nacm(&server.handle).await;

    // Readable module.
    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a",
        &[],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("example:a"));

    // Everything else is filtered away.
    let response = send(
        &server,
        Method::GET,
        "/restconf/data/ietf-yang-library:yang-library",
        &[],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Schema download follows library readability, which the wildcard
    // deny removes.
    let response =
        send(&server, Method::GET, "/yang/example", &[], None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_and_delete_leaf_with_default() {
    let server = start(ServerOptions::default());
    let auth = [("authorization", basic("alice", "secret"))];
    let auth: Vec<(&str, &str)> =
        auth.iter().map(|(n, v)| (*n, v.as_str())).collect();

    // Replacing the schema default reports 204.
    let response = send(
        &server,
        Method::PUT,
        "/restconf/data/example:a/b/c/enabled",
        &[
            ("authorization", auth[0].1),
            ("content-type", "application/yang-data+json"),
        ],
        Some(r#"{"example:enabled": true}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The value reads back.
    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a/b/c/enabled",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("true"));

    // First delete removes the explicit value.
    let response = send(
        &server,
        Method::DELETE,
        "/restconf/data/example:a/b/c/enabled",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Second delete hits the implicit default.
    let response = send(
        &server,
        Method::DELETE,
        "/restconf/data/example:a/b/c/enabled",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_string(response).await.contains("data-missing"));
}

#[tokio::test]
async fn post_creates_exactly_once() {
    let server = start(ServerOptions::default());
    let headers = [
        ("authorization", basic("alice", "secret")),
        (
            "content-type",
            "application/yang-data+json".to_owned(),
        ),
    ];
    let headers: Vec<(&str, &str)> =
        headers.iter().map(|(n, v)| (*n, v.as_str())).collect();
    let body = r#"{"example:ports": [{"name": "eth0", "mtu": 1500}]}"#;

    let response = send(
        &server,
        Method::POST,
        "/restconf/data/example:a",
        &headers,
        Some(body),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert_eq!(location, "/restconf/data/example:a/example:ports=eth0");

    let response = send(
        &server,
        Method::POST,
        "/restconf/data/example:a",
        &headers,
        Some(body),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(body_string(response).await.contains("resource-denied"));
}

#[tokio::test]
async fn rpc_invocation_with_cross_encoding() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::POST,
        "/restconf/operations/example:test-rpc",
        &[
            ("authorization", &basic("alice", "secret")),
            ("content-type", "application/yang-data+json"),
            ("accept", "application/yang-data+xml"),
        ],
        Some(r#"{"example:input": {"i": "ahoj"}}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/yang-data+xml"
    );
    let body = body_string(response).await;
    assert!(body.contains("<out1>ahoj!</out1>"), "body: {body}");
    assert!(body.contains("<out2>done</out2>"), "body: {body}");
}

#[tokio::test]
async fn rpc_and_data_namespaces_do_not_mix() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/yang-data+json"),
    ];

    // RPC via the data resource tree.
    let response = send(
        &server,
        Method::POST,
        "/restconf/data/example:test-rpc",
        &headers,
        Some(r#"{"example:input": {}}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        body_string(response)
            .await
            .contains("/restconf/operations")
    );

    // GET of an RPC node.
    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:test-rpc",
        &[("authorization", auth.as_str())],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        body_string(response).await.contains("is not a data resource")
    );
}

#[tokio::test]
async fn actions_are_invoked_through_data_resources() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/yang-data+json"),
    ];

    // The action handler lives under its schema path.
    let response = send(
        &server,
        Method::POST,
        "/restconf/operations/example:tlist",
        &headers,
        Some("{}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Invoking an action whose list instance doesn't matter for dispatch.
    let response = send(
        &server,
        Method::POST,
        "/restconf/data/example:tlist=one/flip",
        &headers,
        Some(r#"{"example:input": {"direction": "up"}}"#),
    )
    .await;
    // No handler is registered for the action in this test setup.
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("No handler registered"));
}

#[tokio::test]
async fn options_reports_per_kind_methods() {
    let server = start(ServerOptions::default());
    let auth = [("authorization", basic("alice", "secret"))];
    let auth: Vec<(&str, &str)> =
        auth.iter().map(|(n, v)| (*n, v.as_str())).collect();

    let response = send(
        &server,
        Method::OPTIONS,
        "/restconf/data/example:a",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("allow").unwrap(),
        "DELETE, GET, HEAD, OPTIONS, POST, PUT"
    );
    assert!(
        response
            .headers()
            .get("accept-patch")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/yang-patch+json")
    );

    let response = send(
        &server,
        Method::OPTIONS,
        "/restconf/data",
        &auth,
        None,
    )
    .await;
    assert_eq!(
        response.headers().get("allow").unwrap(),
        "GET, HEAD, OPTIONS, POST, PUT"
    );

    let response = send(
        &server,
        Method::OPTIONS,
        "/restconf/operations/example:test-rpc",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.headers().get("allow").unwrap(), "OPTIONS, POST");

    // 405 carries the same Allow set.
    let response = send(
        &server,
        Method::DELETE,
        "/restconf/operations/example:test-rpc",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get("allow").unwrap(), "OPTIONS, POST");
}

#[tokio::test]
async fn yang_library_version() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::GET,
        "/restconf/yang-library-version",
        &[("authorization", &basic("alice", "secret"))],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("2019-01-04"));
}

#[tokio::test]
async fn yang_module_download() {
    let server = start(ServerOptions::default());
    let auth = [("authorization", basic("alice", "secret"))];
    let auth: Vec<(&str, &str)> =
        auth.iter().map(|(n, v)| (*n, v.as_str())).collect();

    let response =
        send(&server, Method::GET, "/yang/example", &auth, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/yang"
    );
    assert!(body_string(response).await.contains("module example"));

    let response = send(
        &server,
        Method::GET,
        "/yang/example@2099-01-01",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );

    let response = send(
        &server,
        Method::GET,
        "/yang/no-such-module",
        &auth,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_of_missing_data() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a/ports=missing",
        &[("authorization", &basic("alice", "secret"))],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_string(response).await.contains("invalid-value"));
}

#[tokio::test]
async fn empty_payload_is_malformed() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::PUT,
        "/restconf/data/example:a/b/c/enabled",
        &[
            ("authorization", &basic("alice", "secret")),
            ("content-type", "application/yang-data+json"),
        ],
        Some("{}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("malformed-message"));
    assert!(body.contains("Empty data tree received"));
}

#[tokio::test]
async fn payload_module_mismatch() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::PUT,
        "/restconf/data/example:a/b/c/enabled",
        &[
            ("authorization", &basic("alice", "secret")),
            ("content-type", "application/yang-data+json"),
        ],
        Some(r#"{"ietf-netconf-acm:enabled": true}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("operation-failed"));
    assert!(body.contains("error-path"));
}

#[tokio::test]
async fn operation_metadata_is_rejected() {
    let server = start(ServerOptions::default());

    let response = send(
        &server,
        Method::PUT,
        "/restconf/data/example:a/b/c/enabled",
        &[
            ("authorization", &basic("alice", "secret")),
            ("content-type", "application/yang-data+json"),
        ],
        Some(
            r#"{"example:enabled": true,
                "@example:enabled": {"ietf-netconf:operation": "merge"}}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("invalid-value"));
}

#[tokio::test]
async fn plain_patch_merges() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");

    let response = send(
        &server,
        Method::PATCH,
        "/restconf/data/example:a/b/c",
        &[
            ("authorization", auth.as_str()),
            ("content-type", "application/yang-data+json"),
        ],
        Some(r#"{"example:c": {"blower": "high"}}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a/b/c/blower",
        &[("authorization", auth.as_str())],
        None,
    )
    .await;
    assert!(body_string(response).await.contains("high"));
}

#[tokio::test]
async fn yang_patch_edit_list() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/yang-patch+json"),
    ];

    let patch = r#"{"ietf-yang-patch:yang-patch":{
        "patch-id":"test-patch",
        "edit":[
            {"edit-id":"add-port","operation":"create",
             "target":"/ports=eth1",
             "value":{"example:ports":[{"name":"eth1","mtu":1400}]}},
            {"edit-id":"turn-on","operation":"replace",
             "target":"/b/c/enabled",
             "value":{"example:enabled":true}}]}}"#;
    let response = send(
        &server,
        Method::PATCH,
        "/restconf/data/example:a",
        &headers,
        Some(patch),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(
        &server,
        Method::GET,
        "/restconf/data/example:a/ports=eth1",
        &[("authorization", auth.as_str())],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("1400"));

    // Failed edits are reported with their edit-id; the transaction
    // doesn't apply partially.
    let patch = r#"{"ietf-yang-patch:yang-patch":{
        "patch-id":"conflicting",
        "edit":[
            {"edit-id":"again","operation":"create",
             "target":"/ports=eth1",
             "value":{"example:ports":[{"name":"eth1","mtu":1400}]}}]}}"#;
    let response = send(
        &server,
        Method::PATCH,
        "/restconf/data/example:a",
        &headers,
        Some(patch),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(body_string(response).await.contains("again"));

    // An empty edit list is invalid.
    let patch = r#"{"ietf-yang-patch:yang-patch":{
        "patch-id":"empty","edit":[]}}"#;
    let response = send(
        &server,
        Method::PATCH,
        "/restconf/data/example:a",
        &headers,
        Some(patch),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn notification_stream_delivers_events_in_order() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");

    let mut bodies = Vec::new();
    for _ in 0..2 {
        let response = send(
            &server,
            Method::GET,
            "/streams/NETCONF/JSON",
            &[("authorization", auth.as_str())],
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        bodies.push(response.into_body());
    }

    for message in ["first", "second"] {
        server
            .handle
            .notify(parse_op(
                &server.handle,
                &format!(r#"{{"example:event":{{"message":"{message}"}}}}"#),
                DataOperation::NotificationYang,
            ))
            .await
            .unwrap();
    }

    // Every client sees every event, in send order.
    for body in bodies.iter_mut() {
        let frame = next_sse_frame(body).await.unwrap();
        assert!(frame.starts_with("data: "), "frame: {frame}");
        assert!(frame.contains("ietf-restconf:notification"));
        assert!(frame.contains("eventTime"));
        assert!(frame.contains("first"));

        let frame = next_sse_frame(body).await.unwrap();
        assert!(frame.contains("second"));
    }
}

#[tokio::test]
async fn dynamic_subscription_lifecycle() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");

    // Establish.
    let response = send(
        &server,
        Method::POST,
        "/restconf/operations/\
         ietf-subscribed-notifications:establish-subscription",
        &[
            ("authorization", auth.as_str()),
            ("content-type", "application/yang-data+json"),
        ],
        Some(
            r#"{"ietf-subscribed-notifications:input":
                {"stream": "NETCONF"}}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    let output = &body["ietf-subscribed-notifications:output"];
    assert!(output["id"].is_number());
    let uri = output["ietf-restconf-subscribed-notifications:uri"]
        .as_str()
        .unwrap()
        .to_owned();
    assert!(uri.starts_with("/streams/subscribed/"), "uri: {uri}");

    // Another user may not attach.
    let response = send(
        &server,
        Method::GET,
        &uri,
        &[("authorization", &basic("bob", "builder"))],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The owner attaches and receives events.
    let response = send(
        &server,
        Method::GET,
        &uri,
        &[("authorization", auth.as_str())],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    // A second receiver is rejected while the first one is attached.
    let response = send(
        &server,
        Method::GET,
        &uri,
        &[("authorization", auth.as_str())],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server
        .handle
        .notify(parse_op(
            &server.handle,
            r#"{"example:event":{"message":"ping"}}"#,
            DataOperation::NotificationYang,
        ))
        .await
        .unwrap();

    let frame = next_sse_frame(&mut body).await.unwrap();
    assert!(frame.contains("example:event"), "frame: {frame}");
    assert!(frame.contains("ping"));
}

#[tokio::test]
async fn unattached_subscriptions_expire() {
    let server = start(ServerOptions {
        inactivity_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let auth = basic("alice", "secret");

    let response = send(
        &server,
        Method::POST,
        "/restconf/operations/\
         ietf-subscribed-notifications:establish-subscription",
        &[
            ("authorization", auth.as_str()),
            ("content-type", "application/yang-data+json"),
        ],
        Some(
            r#"{"ietf-subscribed-notifications:input":
                {"stream": "NETCONF"}}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    let uri = body["ietf-subscribed-notifications:output"]
        ["ietf-restconf-subscribed-notifications:uri"]
        .as_str()
        .unwrap()
        .to_owned();

    // Nobody attaches within the inactivity window.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let response = send(
        &server,
        Method::GET,
        &uri,
        &[("authorization", auth.as_str())],
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn establish_subscription_input_validation() {
    let server = start(ServerOptions::default());
    let auth = basic("alice", "secret");
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/yang-data+json"),
    ];
    let establish = "/restconf/operations/\
         ietf-subscribed-notifications:establish-subscription";

    // Unknown stream.
    let response = send(
        &server,
        Method::POST,
        establish,
        &headers,
        Some(
            r#"{"ietf-subscribed-notifications:input":
                {"stream": "OPTICS"}}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Stream filters by reference are unsupported.
    let response = send(
        &server,
        Method::POST,
        establish,
        &headers,
        Some(
            r#"{"ietf-subscribed-notifications:input":
                {"stream": "NETCONF",
                 "stream-filter-name": "some-filter"}}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        body_string(response)
            .await
            .contains("Stream filtering is not supported")
    );

    // Stop time must lie in the future.
    let response = send(
        &server,
        Method::POST,
        establish,
        &headers,
        Some(
            r#"{"ietf-subscribed-notifications:input":
                {"stream": "NETCONF",
                 "stop-time": "2001-01-01T00:00:00Z"}}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
