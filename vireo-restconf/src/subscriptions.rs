//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use vireo_datastore::{
    DatastoreHandle, DatastoreSession, EngineEvent,
};
use vireo_utils::task::{Task, TimeoutTask};
use vireo_utils::yang::DataNodeRefExt;
use yang3::data::{Data, DataFormat, DataTree};

use crate::errors::{ErrorResponse, ErrorTag, ErrorType};
use crate::notifications;
use crate::stream::EventStream;

const ESTABLISH_SUBSCRIPTION_PATH: &str =
    "/ietf-subscribed-notifications:establish-subscription";
const NO_SUCH_SUBSCRIPTION: &str =
    "ietf-subscribed-notifications:no-such-subscription";

/// One dynamic subscription (RFC 8639 over RESTCONF, RFC 8650).
///
/// Owned exclusively by the [`SubscriptionManager`]; HTTP streams hold
/// shared references and call back through the manager by UUID.
pub struct Subscription {
    pub id: u32,
    pub uuid: Uuid,
    pub user: String,
    pub encoding: DataFormat,
    state: Mutex<SubscriptionState>,
}

struct SubscriptionState {
    phase: Phase,
    // The engine-side event channel. Parked here whenever no receiver is
    // attached; the engine keeps queueing into it meanwhile.
    events: Option<mpsc::Receiver<EngineEvent>>,
    inactivity: Option<TimeoutTask>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Start,
    ReceiverActive,
    Terminating,
}

/// Result of a successful establish-subscription RPC.
pub struct EstablishOutput {
    pub id: u32,
    pub uri: String,
    pub replay_start_revision: Option<DateTime<Utc>>,
}

/// Lifecycle registry for dynamic subscriptions.
pub struct SubscriptionManager {
    inner: Mutex<HashMap<Uuid, Arc<Subscription>>>,
    // Back-reference for timer callbacks; breaks the manager/subscription
    // ownership cycle.
    weak_self: Weak<SubscriptionManager>,
    handle: DatastoreHandle,
    stream_root: String,
    inactivity_timeout: Duration,
    pub max_events_per_wake: usize,
    recovery_user: String,
}

// ===== impl Subscription =====

impl Subscription {
    fn is_ready_to_accept_client(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Start
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dynamic subscription (id {}, user {}, uuid {})",
            self.id, self.user, self.uuid
        )
    }
}

// ===== impl SubscriptionManager =====

impl SubscriptionManager {
    pub fn new(
        handle: DatastoreHandle,
        stream_root: String,
        inactivity_timeout: Duration,
        max_events_per_wake: usize,
        recovery_user: String,
    ) -> Arc<SubscriptionManager> {
        Arc::new_cyclic(|weak_self| SubscriptionManager {
            inner: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
            handle,
            stream_root,
            inactivity_timeout,
            max_events_per_wake,
            recovery_user,
        })
    }

    /// Handles the `establish-subscription` RPC: validates the input,
    /// creates the engine-side subscription and registers it under a fresh
    /// UUID (the UUID keeps the stream URI unpredictable, RFC 8650,
    /// section 5).
    pub async fn establish(
        &self,
        session: &DatastoreSession,
        request_encoding: DataFormat,
        input: &DataTree<'static>,
    ) -> Result<EstablishOutput, ErrorResponse> {
        let rpc = input
            .find_xpath(ESTABLISH_SUBSCRIPTION_PATH)
            .ok()
            .and_then(|mut iter| iter.next())
            .ok_or_else(|| {
                invalid_attribute("Malformed establish-subscription input")
            })?;

        if rpc.get_string_relative("stream-filter-name").is_some() {
            return Err(invalid_attribute(
                "Stream filtering is not supported",
            ));
        }
        let stream = rpc
            .get_string_relative("stream")
            .ok_or_else(|| invalid_attribute("Stream is required"))?;
        let xpath_filter = rpc.get_string_relative("stream-xpath-filter");
        let stop_time =
            optional_time(&rpc, "stop-time")?;
        let replay_start =
            optional_time(&rpc, "replay-start-time")?;
        let encoding = match rpc.get_string_relative("encoding") {
            Some(encoding) => match encoding.as_str() {
                "ietf-subscribed-notifications:encode-json" => {
                    DataFormat::JSON
                }
                "ietf-subscribed-notifications:encode-xml" => {
                    DataFormat::XML
                }
                _ => {
                    return Err(invalid_attribute(format!(
                        "Unsupported encoding in establish-subscription: \
                         '{}'. Currently only 'encode-xml' and \
                         'encode-json' identities are supported.",
                        encoding
                    )));
                }
            },
            None => request_encoding,
        };

        let response = session
            .subscribe(stream, xpath_filter, stop_time, replay_start)
            .await
            .map_err(|error| invalid_attribute(error.to_string()))?;

        // The UUID generator is not re-entrant by design; hold the
        // registry lock while drawing from it.
        let uuid = {
            let _inner = self.inner.lock().unwrap();
            Uuid::new_v4()
        };

        let subscription = Arc::new(Subscription {
            id: response.id,
            uuid,
            user: session.user().to_owned(),
            encoding,
            state: Mutex::new(SubscriptionState {
                phase: Phase::Start,
                events: Some(response.events),
                inactivity: None,
            }),
        });
        debug!(%subscription, "created");

        self.inner
            .lock()
            .unwrap()
            .insert(uuid, subscription.clone());
        self.start_inactivity_timer(&subscription);

        Ok(EstablishOutput {
            id: response.id,
            uri: format!("{}subscribed/{}", self.stream_root, uuid),
            replay_start_revision: response.replay_start_revision,
        })
    }

    /// Returns the subscription iff it exists, still awaits a receiver, and
    /// the user established it (or is the NACM recovery user).
    pub fn attach(
        &self,
        uuid: Uuid,
        user: &str,
    ) -> Option<Arc<Subscription>> {
        let inner = self.inner.lock().unwrap();
        let subscription = inner.get(&uuid)?;
        if subscription.user != user && user != self.recovery_user {
            return None;
        }
        if !subscription.is_ready_to_accept_client() {
            return None;
        }
        Some(subscription.clone())
    }

    /// Moves the subscription into ReceiverActive and hands the event
    /// channel to the caller.
    pub fn client_connected(
        &self,
        subscription: &Arc<Subscription>,
    ) -> Option<mpsc::Receiver<EngineEvent>> {
        debug!(%subscription, "client connected");
        let mut state = subscription.state.lock().unwrap();
        if state.phase != Phase::Start {
            return None;
        }
        state.phase = Phase::ReceiverActive;
        state.inactivity = None;
        state.events.take()
    }

    /// Re-enters Start after a client disconnect, parking the event channel
    /// and restarting the inactivity window.
    pub fn client_disconnected(
        &self,
        subscription: &Arc<Subscription>,
        events: Option<mpsc::Receiver<EngineEvent>>,
    ) {
        debug!(%subscription, "client disconnected");
        {
            let mut state = subscription.state.lock().unwrap();
            if state.phase == Phase::Terminating {
                return;
            }
            state.phase = Phase::Start;
            state.events = events;
        }
        self.start_inactivity_timer(subscription);
    }

    /// Removes a subscription whose engine side already ended.
    pub fn forget(&self, uuid: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscription) = inner.remove(&uuid) {
            subscription.state.lock().unwrap().phase = Phase::Terminating;
        }
    }

    /// Terminates a subscription: asks the engine to end it (with the
    /// given reason identity) and drops the registry entry.
    pub async fn terminate(&self, uuid: Uuid, reason: Option<&str>) {
        let subscription = {
            let mut inner = self.inner.lock().unwrap();
            inner.remove(&uuid)
        };
        let Some(subscription) = subscription else {
            warn!(%uuid, "requested termination of unknown subscription");
            return;
        };

        {
            let mut state = subscription.state.lock().unwrap();
            if state.phase == Phase::Terminating {
                return;
            }
            state.phase = Phase::Terminating;
            state.inactivity = None;
        }
        debug!(%subscription, reason = reason.unwrap_or("<no reason>"),
            "terminating subscription");

        let session = self.handle.session(&self.recovery_user);
        if let Err(error) = session
            .terminate_subscription(
                subscription.id,
                reason.map(str::to_owned),
            )
            .await
        {
            warn!(%subscription, %error, "failed to terminate subscription");
        }
    }

    /// Terminates every live subscription; called on server shutdown.
    pub async fn stop(&self) {
        let uuids = {
            let inner = self.inner.lock().unwrap();
            inner.keys().copied().collect::<Vec<_>>()
        };
        for uuid in uuids {
            self.terminate(uuid, Some(NO_SUCH_SUBSCRIPTION)).await;
        }
    }

    // Arms the inactivity window; expiry tears the subscription down.
    fn start_inactivity_timer(&self, subscription: &Arc<Subscription>) {
        trace!(%subscription, "starting inactivity timer");
        let manager = self.weak_self.clone();
        let uuid = subscription.uuid;
        let timer =
            TimeoutTask::new(self.inactivity_timeout, move || async move {
                if let Some(manager) = Weak::upgrade(&manager) {
                    trace!(%uuid, "client inactive");
                    manager
                        .terminate(uuid, Some(NO_SUCH_SUBSCRIPTION))
                        .await;
                }
            });
        subscription.state.lock().unwrap().inactivity = Some(timer);
    }
}

// ===== global functions =====

/// Drives one attached HTTP stream from the subscription's engine events.
/// At most `max_events_per_wake` queued events are drained per wake so one
/// busy subscription cannot starve the rest of the I/O.
pub fn spawn_subscription_stream(
    manager: &Arc<SubscriptionManager>,
    subscription: Arc<Subscription>,
    stream: &EventStream,
    mut events: mpsc::Receiver<EngineEvent>,
) {
    let manager = manager.clone();
    let stream = stream.clone();
    let max_events_per_wake = manager.max_events_per_wake;

    let mut task = Task::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        // Engine closed the channel: stop-time reached.
                        manager.forget(subscription.uuid);
                        stream.terminate();
                        return;
                    };
                    let mut drained = 1;
                    let mut next = Some(event);
                    while let Some(event) = next.take() {
                        match event {
                            EngineEvent::Notification(notification) => {
                                stream.enqueue(
                                    &notifications::as_restconf_notification(
                                        subscription.encoding,
                                        &notification,
                                    ),
                                );
                            }
                            EngineEvent::Terminated { reason } => {
                                if let Some(reason) = &reason {
                                    stream.enqueue(
                                        &notifications::subscription_terminated(
                                            subscription.encoding,
                                            Utc::now(),
                                            subscription.id,
                                            reason,
                                        ),
                                    );
                                }
                                manager.forget(subscription.uuid);
                                stream.terminate();
                                return;
                            }
                        }
                        if drained < max_events_per_wake {
                            if let Ok(event) = events.try_recv() {
                                drained += 1;
                                next = Some(event);
                            }
                        }
                    }
                }
                _ = stream.wait_closed() => {
                    // Client went away; park the channel so the
                    // subscription can pick up a new receiver.
                    manager.client_disconnected(
                        &subscription,
                        Some(events),
                    );
                    return;
                }
            }
        }
    });
    task.detach();
}

// ===== helper functions =====

fn optional_time(
    rpc: &yang3::data::DataNodeRef<'_>,
    leaf: &str,
) -> Result<Option<DateTime<Utc>>, ErrorResponse> {
    match rpc.get_string_relative(leaf) {
        Some(value) => {
            let time = DateTime::parse_from_rfc3339(&value)
                .map_err(|_| {
                    invalid_attribute(format!(
                        "Invalid date-and-time value in '{}'",
                        leaf
                    ))
                })?
                .with_timezone(&Utc);
            Ok(Some(time))
        }
        None => Ok(None),
    }
}

fn invalid_attribute(message: impl Into<String>) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::BAD_REQUEST,
        ErrorType::Application,
        ErrorTag::InvalidAttribute,
        message,
    )
}
