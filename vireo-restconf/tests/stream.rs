//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use vireo_restconf::stream::EventStream;

async fn next_frame(
    body: &mut (impl Stream<Item = Result<String, std::convert::Infallible>>
              + Unpin),
) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("timed out waiting for a frame")
        .map(|frame| frame.unwrap())
}

#[tokio::test]
async fn frames_are_delivered_in_order() {
    let (stream, mut body) = EventStream::new("test");

    stream.enqueue("first");
    stream.enqueue("second");
    stream.enqueue("third");

    assert_eq!(next_frame(&mut body).await.unwrap(), "data: first\n\n");
    assert_eq!(next_frame(&mut body).await.unwrap(), "data: second\n\n");
    assert_eq!(next_frame(&mut body).await.unwrap(), "data: third\n\n");
}

#[tokio::test]
async fn multiline_messages_become_one_frame() {
    let (stream, mut body) = EventStream::new("test");

    stream.enqueue("{\n  \"x\": 1\n}");
    assert_eq!(
        next_frame(&mut body).await.unwrap(),
        "data: {\ndata:   \"x\": 1\ndata: }\n\n"
    );
}

#[tokio::test]
async fn keepalive_is_a_comment_frame() {
    let (stream, mut body) = EventStream::new("test");

    stream.enqueue_keepalive();
    assert_eq!(next_frame(&mut body).await.unwrap(), ":\n\n");

    // Interleaves with data frames without splitting either.
    stream.enqueue("payload");
    stream.enqueue_keepalive();
    assert_eq!(next_frame(&mut body).await.unwrap(), "data: payload\n\n");
    assert_eq!(next_frame(&mut body).await.unwrap(), ":\n\n");
}

#[tokio::test]
async fn periodic_keepalive() {
    let (stream, mut body) = EventStream::new("test");
    stream.start_keepalive(Duration::from_millis(20));

    assert_eq!(next_frame(&mut body).await.unwrap(), ":\n\n");
    assert_eq!(next_frame(&mut body).await.unwrap(), ":\n\n");
}

#[tokio::test]
async fn terminate_flushes_pending_frames_then_ends() {
    let (stream, mut body) = EventStream::new("test");

    stream.enqueue("before close");
    stream.terminate();

    assert_eq!(
        next_frame(&mut body).await.unwrap(),
        "data: before close\n\n"
    );
    assert_eq!(next_frame(&mut body).await, None);
    assert!(stream.is_closed());
}

#[tokio::test]
async fn enqueue_after_terminate_is_a_noop() {
    let (stream, mut body) = EventStream::new("test");

    stream.terminate();
    stream.enqueue("too late");
    assert_eq!(next_frame(&mut body).await, None);
}

#[tokio::test]
async fn wakes_parked_body_on_enqueue() {
    let (stream, mut body) = EventStream::new("test");

    let producer = tokio::spawn({
        let stream = stream.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stream.enqueue("late arrival");
        }
    });

    assert_eq!(
        next_frame(&mut body).await.unwrap(),
        "data: late arrival\n\n"
    );
    producer.await.unwrap();
}

#[tokio::test]
async fn broadcast_termination_closes_the_stream() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (stream, mut body) = EventStream::new("test");
    stream.watch_termination(shutdown_tx.subscribe());

    shutdown_tx.send(()).unwrap();
    assert_eq!(next_frame(&mut body).await, None);
    assert!(stream.is_closed());
}

#[tokio::test]
async fn dropping_the_body_runs_close_hooks() {
    let (stream, body) = EventStream::new("test");
    let (hook_tx, hook_rx) = tokio::sync::oneshot::channel();
    stream.on_close(move || {
        let _ = hook_tx.send(());
    });

    drop(body);
    tokio::time::timeout(Duration::from_secs(1), hook_rx)
        .await
        .expect("close hook did not run")
        .unwrap();
    assert!(stream.is_closed());
}
