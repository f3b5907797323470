//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, trace};
use vireo_utils::task::{IntervalTask, Task};

/// Delivers application messages to one HTTP client as `text/event-stream`
/// frames.
///
/// Producers enqueue whole messages; the response body pulls formatted SSE
/// frames. The nghttp2-style deferred/resume dance maps onto poll/waker:
/// an empty queue parks the body with a stored waker, and every enqueue
/// wakes it.
#[derive(Clone)]
pub struct EventStream {
    shared: Arc<Shared>,
}

/// The response body half of an [`EventStream`]. Dropping it (the client
/// went away, or the server finished the final flush) closes the stream.
pub struct EventStreamBody {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    closed: Notify,
    peer: String,
}

struct State {
    phase: Phase,
    queue: VecDeque<String>,
    waker: Option<Waker>,
    // Keep-alive and helper tasks die with the stream.
    keepalive: Option<IntervalTask>,
    tasks: Vec<Task<()>>,
    on_close: Vec<Box<dyn FnOnce() + Send>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    HasEvents,
    WaitingForEvents,
    WantToClose,
    Closed,
}

// ===== impl EventStream =====

impl EventStream {
    pub fn new(peer: impl Into<String>) -> (EventStream, EventStreamBody) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::WaitingForEvents,
                queue: VecDeque::new(),
                waker: None,
                keepalive: None,
                tasks: Vec::new(),
                on_close: Vec::new(),
            }),
            closed: Notify::new(),
            peer: peer.into(),
        });
        (
            EventStream {
                shared: shared.clone(),
            },
            EventStreamBody { shared },
        )
    }

    /// Formats one application message as a single SSE frame and queues it.
    /// Each physical line of the message becomes one `data:` record.
    pub fn enqueue(&self, message: &str) {
        let mut frame = String::with_capacity(message.len() + 16);
        for line in message.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        self.enqueue_frame(frame);
    }

    /// Queues a keep-alive comment frame.
    pub fn enqueue_keepalive(&self) {
        self.enqueue_frame(":\n\n".to_owned());
    }

    /// Requests a graceful close: pending frames are flushed, then the body
    /// signals end-of-stream.
    pub fn terminate(&self) {
        let mut state = self.shared.state.lock().unwrap();
        match state.phase {
            Phase::Closed | Phase::WantToClose => (),
            _ => {
                trace!(peer = %self.shared.peer, "will terminate");
                state.phase = Phase::WantToClose;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    /// Starts periodic keep-alive comment frames.
    pub fn start_keepalive(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.shared);
        let task = IntervalTask::new(interval, false, move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    trace!(peer = %shared.peer, "keep-alive ping enqueued");
                    EventStream { shared }.enqueue_keepalive();
                }
            }
        });
        self.shared.state.lock().unwrap().keepalive = Some(task);
    }

    /// Closes the stream when the server-wide termination signal fires.
    pub fn watch_termination(&self, mut shutdown: broadcast::Receiver<()>) {
        let weak = Arc::downgrade(&self.shared);
        let task = Task::spawn(async move {
            let _ = shutdown.recv().await;
            if let Some(shared) = weak.upgrade() {
                EventStream { shared }.terminate();
            }
        });
        self.hold_task(task);
    }

    /// Parks a helper task whose lifetime is tied to the stream.
    pub fn hold_task(&self, task: Task<()>) {
        self.shared.state.lock().unwrap().tasks.push(task);
    }

    /// Registers a hook to run when the stream reaches `Closed`.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if state.phase == Phase::Closed {
            drop(state);
            hook();
        } else {
            state.on_close.push(Box::new(hook));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().phase == Phase::Closed
    }

    /// Completes once the stream is closed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.shared.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn enqueue_frame(&self, frame: String) {
        let mut state = self.shared.state.lock().unwrap();
        match state.phase {
            Phase::Closed | Phase::WantToClose => {
                trace!(peer = %self.shared.peer, "enqueue: already disconnected");
            }
            _ => {
                state.queue.push_back(frame);
                state.phase = Phase::HasEvents;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            }
        }
    }
}

// ===== impl Shared =====

impl Shared {
    // Final transition. Idempotent; cancels timers and runs close hooks.
    fn close(&self) {
        let (hooks, tasks, keepalive) = {
            let mut state = self.state.lock().unwrap();
            if state.phase == Phase::Closed {
                return;
            }
            debug!(peer = %self.peer, "stream closed");
            state.phase = Phase::Closed;
            state.queue.clear();
            state.waker = None;
            (
                std::mem::take(&mut state.on_close),
                std::mem::take(&mut state.tasks),
                state.keepalive.take(),
            )
        };
        drop(keepalive);
        drop(tasks);
        for hook in hooks {
            hook();
        }
        self.closed.notify_waiters();
    }
}

// ===== impl EventStreamBody =====

impl Stream for EventStreamBody {
    type Item = Result<String, std::convert::Infallible>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let mut state = self.shared.state.lock().unwrap();
        match state.phase {
            Phase::HasEvents => match state.queue.pop_front() {
                Some(frame) => {
                    if state.queue.is_empty() {
                        state.phase = Phase::WaitingForEvents;
                    }
                    trace!(peer = %self.shared.peer, "sent one event");
                    Poll::Ready(Some(Ok(frame)))
                }
                None => {
                    state.phase = Phase::WaitingForEvents;
                    state.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            },
            Phase::WaitingForEvents => {
                trace!(peer = %self.shared.peer, "sleeping");
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Phase::WantToClose => match state.queue.pop_front() {
                Some(frame) => Poll::Ready(Some(Ok(frame))),
                None => {
                    drop(state);
                    self.shared.close();
                    Poll::Ready(None)
                }
            },
            Phase::Closed => Poll::Ready(None),
        }
    }
}

impl Drop for EventStreamBody {
    fn drop(&mut self) {
        self.shared.close();
    }
}
