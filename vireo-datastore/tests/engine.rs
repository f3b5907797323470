//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use vireo_datastore::{
    Datastore, DatastoreEngine, DatastoreHandle, EngineConfig, EngineEvent,
    Error, GetParams,
};
use yang3::data::{
    Data, DataFormat, DataOperation, DataParserFlags, DataTree,
    DataValidationFlags,
};

const ENABLED: &str = "/example:a/b/c/enabled";

fn engine_config() -> EngineConfig {
    EngineConfig {
        yang_search_dirs: vec![format!(
            "{}/tests/yang",
            env!("CARGO_MANIFEST_DIR")
        )],
        yang_modules: vec!["example".to_owned()],
        ..Default::default()
    }
}

// The returned sender keeps the engine task alive; dropping it counts as a
// shutdown request.
fn start_engine() -> (DatastoreHandle, broadcast::Sender<()>) {
    let (engine, handle, _nacm_rx) = DatastoreEngine::init(engine_config());
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(engine.run(shutdown_tx.subscribe()));
    (handle, shutdown_tx)
}

fn parse_config(
    handle: &DatastoreHandle,
    json: &str,
) -> DataTree<'static> {
    DataTree::parse_string(
        handle.context(),
        json,
        DataFormat::JSON,
        DataParserFlags::empty(),
        DataValidationFlags::NO_STATE | DataValidationFlags::PRESENT,
    )
    .unwrap()
}

fn parse_notification(
    handle: &DatastoreHandle,
    json: &str,
) -> DataTree<'static> {
    DataTree::parse_op_string(
        handle.context(),
        json,
        DataFormat::JSON,
        DataOperation::NotificationYang,
    )
    .unwrap()
}

#[tokio::test]
async fn replace_and_delete_of_a_defaulted_leaf() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    // The leaf exists as a schema default, so a PUT replaces it.
    let tree = parse_config(
        &handle,
        r#"{"example:a":{"b":{"c":{"enabled":true}}}}"#,
    );
    let created = session
        .replace(Datastore::Running, ENABLED.to_owned(), tree)
        .await
        .unwrap();
    assert!(!created);

    // Deleting the explicitly set value succeeds once.
    session
        .delete(Datastore::Running, ENABLED.to_owned())
        .await
        .unwrap();

    // The second delete hits the re-materialized default.
    let error = session
        .delete(Datastore::Running, ENABLED.to_owned())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::DefaultValue(_)));
}

#[tokio::test]
async fn create_conflicts_and_missing_deletes() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    let port = r#"{"example:a":{"ports":[{"name":"eth0","mtu":1500}]}}"#;
    session
        .create(
            Datastore::Running,
            "/example:a/ports[name='eth0']".to_owned(),
            parse_config(&handle, port),
        )
        .await
        .unwrap();

    // Same create again conflicts.
    let error = session
        .create(
            Datastore::Running,
            "/example:a/ports[name='eth0']".to_owned(),
            parse_config(&handle, port),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ItemExists(_)));

    // Deleting something that never existed reports it as missing.
    let error = session
        .delete(
            Datastore::Running,
            "/example:a/ports[name='lo']".to_owned(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ItemNotFound(_)));
}

#[tokio::test]
async fn writes_are_isolated_until_valid() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    // Merging a value of the wrong type must not corrupt the datastore.
    let result = DataTree::parse_string(
        handle.context(),
        r#"{"example:a":{"ports":[{"name":"eth0","mtu":"soft"}]}}"#,
        DataFormat::JSON,
        DataParserFlags::empty(),
        DataValidationFlags::NO_STATE | DataValidationFlags::PRESENT,
    );
    assert!(result.is_err());

    let dtree = session
        .get(Datastore::Running, None, GetParams::default())
        .await
        .unwrap();
    assert!(dtree.find_path("/example:a/ports").is_err());
}

#[tokio::test]
async fn nacm_read_filtering() {
    let (handle, _shutdown) = start_engine();
    let root = handle.session("root");

    root.merge(
        Datastore::Running,
        parse_config(
            &handle,
            r#"{"example:a":{"b":{"c":{"blower":"high"}}}}"#,
        ),
    )
    .await
    .unwrap();

    // Anonymous may read the example module and nothing else.
    root.merge(
        Datastore::Running,
        parse_config(
            &handle,
            r#"{"ietf-netconf-acm:nacm":{
                "enable-nacm":true,
                "groups":{"group":[
                    {"name":"yangnobody","user-name":["yangnobody"]}]},
                "rule-list":[{"name":"anon","group":["yangnobody"],
                    "rule":[
                        {"name":"read-example","module-name":"example",
                         "access-operations":"read","action":"permit"},
                        {"name":"deny-rest","module-name":"*",
                         "access-operations":"*","action":"deny"}]}]}}"#,
        ),
    )
    .await
    .unwrap();

    let dtree = handle
        .session("yangnobody")
        .get(Datastore::Operational, None, GetParams::default())
        .await
        .unwrap();
    assert!(dtree.find_path("/example:a/b/c/blower").is_ok());
    assert!(
        dtree
            .find_path("/ietf-yang-library:yang-library")
            .is_err()
    );

    // The recovery user keeps seeing everything.
    let dtree = root
        .get(Datastore::Operational, None, GetParams::default())
        .await
        .unwrap();
    assert!(
        dtree
            .find_path("/ietf-yang-library:yang-library")
            .is_ok()
    );
}

#[tokio::test]
async fn nacm_write_denial() {
    let (handle, _shutdown) = start_engine();
    let root = handle.session("root");

    root.merge(
        Datastore::Running,
        parse_config(
            &handle,
            r#"{"ietf-netconf-acm:nacm":{"enable-nacm":true}}"#,
        ),
    )
    .await
    .unwrap();

    // No rule permits bob, so the write-default (deny) applies.
    let error = handle
        .session("bob")
        .replace(
            Datastore::Running,
            ENABLED.to_owned(),
            parse_config(
                &handle,
                r#"{"example:a":{"b":{"c":{"enabled":true}}}}"#,
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::AccessDenied(_)));
}

#[tokio::test]
async fn depth_limited_reads() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    session
        .merge(
            Datastore::Running,
            parse_config(
                &handle,
                r#"{"example:a":{"b":{"c":{"blower":"low"}}}}"#,
            ),
        )
        .await
        .unwrap();

    let dtree = session
        .get(
            Datastore::Running,
            Some("/example:a".to_owned()),
            GetParams {
                max_depth: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(dtree.find_path("/example:a/b").is_ok());
    assert!(dtree.find_path("/example:a/b/c").is_err());
}

#[tokio::test]
async fn notifications_fan_out_and_replay() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    let mut firehose = handle.notifications();

    handle
        .notify(parse_notification(
            &handle,
            r#"{"example:event":{"message":"one"}}"#,
        ))
        .await
        .unwrap();

    let notification = tokio::time::timeout(
        Duration::from_secs(5),
        firehose.recv(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(notification.path, "/example:event");
    assert!(notification.json.contains("\"message\""));
    assert!(notification.json.contains("one"));
    assert!(notification.xml.contains("<message>one</message>"));

    // A replay subscription starting before the engine existed is adjusted
    // and still sees the buffered event.
    let replay_start = Utc::now() - chrono::Duration::hours(1);
    let mut response = session
        .subscribe("NETCONF".to_owned(), None, None, Some(replay_start))
        .await
        .unwrap();
    assert!(response.replay_start_revision.is_some());

    let event = tokio::time::timeout(
        Duration::from_secs(5),
        response.events.recv(),
    )
    .await
    .unwrap()
    .unwrap();
    let EngineEvent::Notification(notification) = event else {
        panic!("expected a notification");
    };
    assert!(notification.json.contains("one"));
}

#[tokio::test]
async fn subscription_time_validation() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    // Stop time in the past.
    let error = session
        .subscribe(
            "NETCONF".to_owned(),
            None,
            Some(Utc::now() - chrono::Duration::seconds(10)),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::BadInput(_)));

    // Replay start in the future.
    let error = session
        .subscribe(
            "NETCONF".to_owned(),
            None,
            None,
            Some(Utc::now() + chrono::Duration::seconds(60)),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::BadInput(_)));

    // Unknown stream.
    let error = session
        .subscribe("OPTICS".to_owned(), None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::UnknownStream(_)));
}

#[tokio::test]
async fn terminated_subscriptions_signal_their_reason() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    let mut response = session
        .subscribe("NETCONF".to_owned(), None, None, None)
        .await
        .unwrap();

    session
        .terminate_subscription(
            response.id,
            Some(
                "ietf-subscribed-notifications:no-such-subscription"
                    .to_owned(),
            ),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(
        Duration::from_secs(5),
        response.events.recv(),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(
        event,
        EngineEvent::Terminated { reason: Some(_) }
    ));

    // The channel closes afterwards.
    let end = tokio::time::timeout(
        Duration::from_secs(5),
        response.events.recv(),
    )
    .await
    .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn module_text_retrieval() {
    let (handle, _shutdown) = start_engine();
    let session = handle.session("root");

    let text = session
        .module_text("example".to_owned(), None)
        .await
        .unwrap()
        .expect("module text missing");
    assert!(text.contains("module example"));

    let missing = session
        .module_text("example".to_owned(), Some("2099-01-01".to_owned()))
        .await
        .unwrap();
    assert!(missing.is_none());

    let embedded = session
        .module_text(
            "ietf-netconf-acm".to_owned(),
            Some("2018-02-14".to_owned()),
        )
        .await
        .unwrap()
        .expect("embedded module text missing");
    assert!(embedded.contains("module ietf-netconf-acm"));
}
