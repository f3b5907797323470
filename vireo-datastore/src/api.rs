//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_new::new;
use tokio::sync::{broadcast, mpsc, oneshot};
use vireo_utils::{Responder, Sender};
use yang3::context::Context;
use yang3::data::DataTree;

use crate::error::{Error, Result};

/// The conventional datastores (RFC 8342).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Datastore {
    Running,
    Startup,
    Candidate,
    Operational,
}

/// `with-defaults` retrieval modes (RFC 6243).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WithDefaults {
    ReportAll,
    ReportAllTagged,
    Trim,
    Explicit,
}

/// `content` retrieval filter (RFC 8040, section 4.8.1).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ContentFilter {
    Config,
    Nonconfig,
    #[default]
    All,
}

/// Retrieval options applied by the engine before the response tree is
/// handed back.
#[derive(Clone, Debug, Default)]
pub struct GetParams {
    pub max_depth: Option<u32>,
    pub content: ContentFilter,
}

/// Edit operations of a YANG-Patch edit list (RFC 8072, section 2.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditOperation {
    Create,
    Merge,
    Replace,
    Remove,
    Delete,
}

/// One edit of a YANG-Patch request.
pub struct PatchEdit {
    pub edit_id: String,
    pub operation: EditOperation,
    pub xpath: String,
    pub tree: Option<DataTree<'static>>,
}

/// One event record broadcast to notification subscribers.
///
/// The record is serialized once, in both supported encodings, when the
/// notification enters the engine; streams only splice the prepared text
/// into their transport envelopes.
#[derive(Debug, new)]
pub struct Notification {
    pub time: DateTime<Utc>,
    /// Schema path of the notification node (e.g. `/example:event`).
    pub path: String,
    pub json: String,
    pub xml: String,
}

/// Events delivered on a dynamic-subscription channel.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Notification(Arc<Notification>),
    /// The engine-side subscription ended; `reason` carries the
    /// termination-reason identity when the end was requested rather than
    /// reached (stop-time).
    Terminated { reason: Option<String> },
}

/// Successful establish-subscription result.
#[derive(Debug)]
pub struct SubscribeResponse {
    pub id: u32,
    pub events: mpsc::Receiver<EngineEvent>,
    /// Set when the requested replay start predates the replay buffer and
    /// was moved forward.
    pub replay_start_revision: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum Request {
    Get(GetRequest),
    Create(EditRequest),
    Replace(EditRequest),
    Merge(EditRequest),
    Delete(DeleteRequest),
    Patch(PatchRequest),
    Rpc(RpcRequest),
    Notify(NotifyRequest),
    Subscribe(SubscribeRequest),
    Terminate(TerminateRequest),
    ModuleText(ModuleTextRequest),
}

#[derive(Debug)]
pub struct GetRequest {
    pub datastore: Datastore,
    pub xpath: Option<String>,
    pub params: GetParams,
    pub user: String,
    pub responder: Responder<Result<DataTree<'static>>>,
}

#[derive(Debug)]
pub struct EditRequest {
    pub datastore: Datastore,
    /// Canonical path of the node the edit targets; empty for whole-datastore
    /// operations.
    pub xpath: String,
    pub tree: DataTree<'static>,
    pub user: String,
    /// `true` in the response when the edit created the target rather than
    /// replacing it.
    pub responder: Responder<Result<bool>>,
}

#[derive(Debug)]
pub struct DeleteRequest {
    pub datastore: Datastore,
    pub xpath: String,
    pub user: String,
    pub responder: Responder<Result<()>>,
}

pub struct PatchRequest {
    pub datastore: Datastore,
    pub edits: Vec<PatchEdit>,
    pub user: String,
    /// On failure, the edit-id of the failed edit accompanies the error.
    pub responder: Responder<std::result::Result<(), (String, Error)>>,
}

#[derive(Debug)]
pub struct RpcRequest {
    pub xpath: String,
    pub input: DataTree<'static>,
    pub user: String,
    pub responder: Responder<Result<DataTree<'static>>>,
}

#[derive(Debug)]
pub struct NotifyRequest {
    pub tree: DataTree<'static>,
}

#[derive(Debug)]
pub struct SubscribeRequest {
    pub stream: String,
    pub xpath_filter: Option<String>,
    pub stop_time: Option<DateTime<Utc>>,
    pub replay_start: Option<DateTime<Utc>>,
    pub user: String,
    pub responder: Responder<Result<SubscribeResponse>>,
}

#[derive(Debug)]
pub struct TerminateRequest {
    pub id: u32,
    pub reason: Option<String>,
    pub responder: Option<Responder<Result<()>>>,
}

#[derive(Debug)]
pub struct ModuleTextRequest {
    pub name: String,
    pub revision: Option<String>,
    pub responder: Responder<Option<String>>,
}

/// Cloneable handle to the datastore engine task.
#[derive(Clone)]
pub struct DatastoreHandle {
    ctx: &'static Context,
    request_tx: Sender<Request>,
    notif_tx: broadcast::Sender<Arc<Notification>>,
}

/// A [`DatastoreHandle`] bound to an authenticated user, standing in for
/// one protocol session. The engine evaluates NACM against this user.
#[derive(Clone)]
pub struct DatastoreSession {
    handle: DatastoreHandle,
    user: String,
}

// ===== impl Datastore =====

impl Datastore {
    /// Parses a qualified datastore name from a `/restconf/ds/` URI.
    pub fn from_qualified_name(name: &str) -> Option<Datastore> {
        match name {
            "ietf-datastores:running" => Some(Datastore::Running),
            "ietf-datastores:startup" => Some(Datastore::Startup),
            "ietf-datastores:candidate" => Some(Datastore::Candidate),
            "ietf-datastores:operational" => Some(Datastore::Operational),
            _ => None,
        }
    }
}

impl std::fmt::Display for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datastore::Running => write!(f, "running"),
            Datastore::Startup => write!(f, "startup"),
            Datastore::Candidate => write!(f, "candidate"),
            Datastore::Operational => write!(f, "operational"),
        }
    }
}

// ===== impl DatastoreHandle =====

impl DatastoreHandle {
    pub(crate) fn new(
        ctx: &'static Context,
        request_tx: Sender<Request>,
        notif_tx: broadcast::Sender<Arc<Notification>>,
    ) -> DatastoreHandle {
        DatastoreHandle {
            ctx,
            request_tx,
            notif_tx,
        }
    }

    /// The YANG context shared with the engine.
    pub fn context(&self) -> &'static Context {
        self.ctx
    }

    /// Binds a user to a new logical session.
    pub fn session(&self, user: &str) -> DatastoreSession {
        DatastoreSession {
            handle: self.clone(),
            user: user.to_owned(),
        }
    }

    /// Subscribes to the firehose of every notification the engine emits.
    pub fn notifications(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.notif_tx.subscribe()
    }

    /// Publishes a notification. This is the provider-facing entry point;
    /// RESTCONF clients never reach it directly.
    pub async fn notify(&self, tree: DataTree<'static>) -> Result<()> {
        self.request(Request::Notify(NotifyRequest { tree })).await
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::EngineGone)
    }
}

// ===== impl DatastoreSession =====

impl DatastoreSession {
    pub fn context(&self) -> &'static Context {
        self.handle.context()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub async fn get(
        &self,
        datastore: Datastore,
        xpath: Option<String>,
        params: GetParams,
    ) -> Result<DataTree<'static>> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::Get(GetRequest {
                datastore,
                xpath,
                params,
                user: self.user.clone(),
                responder,
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    pub async fn create(
        &self,
        datastore: Datastore,
        xpath: String,
        tree: DataTree<'static>,
    ) -> Result<()> {
        self.edit(datastore, xpath, tree, Request::Create)
            .await
            .map(|_| ())
    }

    /// Replaces the target, creating it when absent. Returns `true` when the
    /// target was created.
    pub async fn replace(
        &self,
        datastore: Datastore,
        xpath: String,
        tree: DataTree<'static>,
    ) -> Result<bool> {
        self.edit(datastore, xpath, tree, Request::Replace).await
    }

    pub async fn merge(
        &self,
        datastore: Datastore,
        tree: DataTree<'static>,
    ) -> Result<()> {
        self.edit(datastore, String::new(), tree, Request::Merge)
            .await
            .map(|_| ())
    }

    pub async fn delete(
        &self,
        datastore: Datastore,
        xpath: String,
    ) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::Delete(DeleteRequest {
                datastore,
                xpath,
                user: self.user.clone(),
                responder,
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    pub async fn patch(
        &self,
        datastore: Datastore,
        edits: Vec<PatchEdit>,
    ) -> std::result::Result<(), (String, Error)> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::Patch(PatchRequest {
                datastore,
                edits,
                user: self.user.clone(),
                responder,
            }))
            .await
            .map_err(|error| (String::new(), error))?;
        rx.await
            .map_err(|_| (String::new(), Error::EngineGone))?
    }

    pub async fn rpc(
        &self,
        xpath: String,
        input: DataTree<'static>,
    ) -> Result<DataTree<'static>> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::Rpc(RpcRequest {
                xpath,
                input,
                user: self.user.clone(),
                responder,
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    pub async fn subscribe(
        &self,
        stream: String,
        xpath_filter: Option<String>,
        stop_time: Option<DateTime<Utc>>,
        replay_start: Option<DateTime<Utc>>,
    ) -> Result<SubscribeResponse> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::Subscribe(SubscribeRequest {
                stream,
                xpath_filter,
                stop_time,
                replay_start,
                user: self.user.clone(),
                responder,
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    pub async fn terminate_subscription(
        &self,
        id: u32,
        reason: Option<String>,
    ) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::Terminate(TerminateRequest {
                id,
                reason,
                responder: Some(responder),
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    pub async fn module_text(
        &self,
        name: String,
        revision: Option<String>,
    ) -> Result<Option<String>> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(Request::ModuleText(ModuleTextRequest {
                name,
                revision,
                responder,
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)
    }

    async fn edit(
        &self,
        datastore: Datastore,
        xpath: String,
        tree: DataTree<'static>,
        wrap: fn(EditRequest) -> Request,
    ) -> Result<bool> {
        let (responder, rx) = oneshot::channel();
        self.handle
            .request(wrap(EditRequest {
                datastore,
                xpath,
                tree,
                user: self.user.clone(),
                responder,
            }))
            .await?;
        rx.await.map_err(|_| Error::EngineGone)?
    }
}

impl std::fmt::Debug for PatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchRequest")
            .field("datastore", &self.datastore)
            .field("edits", &self.edits.len())
            .field("user", &self.user)
            .finish()
    }
}
