//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, trace, warn};
use vireo_utils::Receiver;
use vireo_utils::task::TimeoutTask;
use yang3::context::Context;
use yang3::data::{
    Data, DataFormat, DataParserFlags, DataPrinterFlags, DataTree,
    DataValidationFlags,
};
use yang3::iter::NodeIterable;
use yang3::schema::SchemaNodeKind;

use crate::api::{
    ContentFilter, DatastoreHandle, EditOperation, EngineEvent, GetParams,
    Notification, PatchEdit, Request, SubscribeResponse,
};
use crate::api;
use crate::error::{Error, Result};
use crate::nacm::{Access, NacmRules};

/// Handler invoked for a YANG RPC or action. Receives the parsed input tree
/// and produces the output tree.
pub type RpcHandler = Box<
    dyn Fn(&'static Context, &DataTree<'static>) -> Result<DataTree<'static>>
        + Send,
>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directories searched for YANG modules beyond the embedded set.
    pub yang_search_dirs: Vec<String>,
    /// Modules implemented by the managed system.
    pub yang_modules: Vec<String>,
    /// Initial running configuration, JSON or XML.
    pub startup_config_path: Option<String>,
    /// The NACM recovery user bypasses all access control.
    pub recovery_user: String,
    /// Number of notifications retained for replay.
    pub replay_buffer_size: usize,
    /// Per-subscription event queue depth.
    pub subscription_queue_size: usize,
}

pub struct DatastoreEngine {
    ctx: &'static Context,
    running: DataTree<'static>,
    startup: DataTree<'static>,
    candidate: DataTree<'static>,
    operational: DataTree<'static>,
    config: EngineConfig,
    // Parsed access-control rules, republished on every change.
    nacm: Arc<NacmRules>,
    nacm_tx: watch::Sender<Arc<NacmRules>>,
    // Channel used to receive requests from the gateway.
    rx: Receiver<Request>,
    // Loopback sender used by deferred work (subscription stop-time).
    self_tx: vireo_utils::Sender<Request>,
    // Notification fan-out and replay.
    notif_tx: broadcast::Sender<Arc<Notification>>,
    replay: VecDeque<Arc<Notification>>,
    replay_started: DateTime<Utc>,
    replay_trimmed: bool,
    // Live engine-side subscriptions.
    subscriptions: HashMap<u32, EngineSubscription>,
    next_subscription_id: u32,
    // RPC/action handlers, keyed by schema path.
    rpc_handlers: HashMap<String, RpcHandler>,
    // Raw module sources served by the schema endpoint.
    module_sources: HashMap<String, String>,
}

struct EngineSubscription {
    tx: mpsc::Sender<EngineEvent>,
    xpath_filter: Option<String>,
    _stop: Option<TimeoutTask>,
}

// ===== impl EngineConfig =====

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            yang_search_dirs: Vec::new(),
            yang_modules: Vec::new(),
            startup_config_path: None,
            recovery_user: "root".to_owned(),
            replay_buffer_size: 512,
            subscription_queue_size: 1024,
        }
    }
}

// ===== impl DatastoreEngine =====

impl DatastoreEngine {
    /// Builds the engine and the request handle the gateway talks through.
    ///
    /// The YANG context is deliberately leaked: data trees borrow from it
    /// for the whole process lifetime, and every engine instance owns its
    /// own context so tests can run several engines side by side.
    pub fn init(
        config: EngineConfig,
    ) -> (DatastoreEngine, DatastoreHandle, watch::Receiver<Arc<NacmRules>>)
    {
        let mut ctx = vireo_yang::new_context(
            config.yang_search_dirs.iter().map(|dir| dir.as_str()),
        );
        for module in vireo_yang::YANG_BASE_MODULES.iter() {
            vireo_yang::load_module(&mut ctx, module);
        }
        for module in config.yang_modules.iter() {
            vireo_yang::load_module(&mut ctx, module);
        }
        let ctx: &'static Context = Box::leak(Box::new(ctx));

        let module_sources = load_module_sources(ctx, &config);

        let mut running = DataTree::new(ctx);
        if let Some(path) = &config.startup_config_path {
            match load_startup_config(ctx, path) {
                Ok(dtree) => running = dtree,
                Err(error) => {
                    error!(%error, %path, "failed to load startup configuration");
                }
            }
        }
        if let Err(error) =
            running.validate(DataValidationFlags::NO_STATE)
        {
            error!(%error, "initial configuration is invalid");
        }

        let mut operational = DataTree::new(ctx);
        if let Err(error) = init_yang_library(ctx, &mut operational) {
            error!(%error, "failed to populate ietf-yang-library data");
        }

        let nacm = Arc::new(NacmRules::from_data(&running));
        let (nacm_tx, nacm_rx) = watch::channel(nacm.clone());

        let (request_tx, request_rx) = mpsc::channel(4);
        let (notif_tx, _) = broadcast::channel(64);

        let handle =
            DatastoreHandle::new(ctx, request_tx.clone(), notif_tx.clone());

        let engine = DatastoreEngine {
            ctx,
            running,
            startup: DataTree::new(ctx),
            candidate: DataTree::new(ctx),
            operational,
            config,
            nacm,
            nacm_tx,
            rx: request_rx,
            self_tx: request_tx,
            notif_tx,
            replay: VecDeque::new(),
            replay_started: Utc::now(),
            replay_trimmed: false,
            subscriptions: HashMap::new(),
            next_subscription_id: 1,
            rpc_handlers: HashMap::new(),
            module_sources,
        };

        (engine, handle, nacm_rx)
    }

    /// Registers a handler for a YANG RPC or action, keyed by its schema
    /// path (e.g. `/example:test-rpc`).
    pub fn register_rpc<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(
                &'static Context,
                &DataTree<'static>,
            ) -> Result<DataTree<'static>>
            + Send
            + 'static,
    {
        self.rpc_handlers.insert(path.to_owned(), Box::new(handler));
    }

    pub fn context(&self) -> &'static Context {
        self.ctx
    }

    // Main event loop.
    #[instrument(skip_all, name = "datastore")]
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.process_request(request),
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    debug!("shutting down");
                    self.rx.close();
                    break;
                }
            }
        }
    }

    fn process_request(&mut self, request: Request) {
        trace!(?request, "received request");

        match request {
            Request::Get(request) => {
                let response = self.get_data(
                    request.datastore,
                    request.xpath.as_deref(),
                    &request.params,
                    &request.user,
                );
                let _ = request.responder.send(response);
            }
            Request::Create(request) => {
                let response = self
                    .apply_edit(
                        request.datastore,
                        EditOperation::Create,
                        &request.xpath,
                        Some(request.tree),
                        &request.user,
                    )
                    .map(|outcome| outcome.created);
                let _ = request.responder.send(response);
            }
            Request::Replace(request) => {
                let response = self
                    .apply_edit(
                        request.datastore,
                        EditOperation::Replace,
                        &request.xpath,
                        Some(request.tree),
                        &request.user,
                    )
                    .map(|outcome| outcome.created);
                let _ = request.responder.send(response);
            }
            Request::Merge(request) => {
                let response = self
                    .apply_edit(
                        request.datastore,
                        EditOperation::Merge,
                        &request.xpath,
                        Some(request.tree),
                        &request.user,
                    )
                    .map(|_| true);
                let _ = request.responder.send(response);
            }
            Request::Delete(request) => {
                let response = self
                    .apply_edit(
                        request.datastore,
                        EditOperation::Delete,
                        &request.xpath,
                        None,
                        &request.user,
                    )
                    .map(|_| ());
                let _ = request.responder.send(response);
            }
            Request::Patch(request) => {
                let response = self.apply_patch(
                    request.datastore,
                    request.edits,
                    &request.user,
                );
                let _ = request.responder.send(response);
            }
            Request::Rpc(request) => {
                let response = self.invoke_rpc(
                    &request.xpath,
                    &request.input,
                    &request.user,
                );
                if let Err(error) = &response {
                    warn!(%error, xpath = %request.xpath, "RPC failed");
                }
                let _ = request.responder.send(response);
            }
            Request::Notify(request) => {
                if let Err(error) = self.publish_notification(request.tree) {
                    warn!(%error, "failed to publish notification");
                }
            }
            Request::Subscribe(request) => {
                let response = self.subscribe(
                    request.stream,
                    request.xpath_filter,
                    request.stop_time,
                    request.replay_start,
                );
                let _ = request.responder.send(response);
            }
            Request::Terminate(request) => {
                let response =
                    self.terminate_subscription(request.id, request.reason);
                if let Some(responder) = request.responder {
                    let _ = responder.send(response);
                }
            }
            Request::ModuleText(request) => {
                let response = self.module_text(
                    &request.name,
                    request.revision.as_deref(),
                );
                let _ = request.responder.send(response);
            }
        }
    }

    // Retrieves a (filtered) copy of the requested datastore contents.
    fn get_data(
        &self,
        datastore: api::Datastore,
        xpath: Option<&str>,
        params: &GetParams,
        user: &str,
    ) -> Result<DataTree<'static>> {
        let source = match datastore {
            api::Datastore::Running => {
                self.running.duplicate().map_err(Error::YangInternal)?
            }
            api::Datastore::Startup => {
                self.startup.duplicate().map_err(Error::YangInternal)?
            }
            api::Datastore::Candidate => {
                self.candidate.duplicate().map_err(Error::YangInternal)?
            }
            api::Datastore::Operational => {
                let mut dtree =
                    self.running.duplicate().map_err(Error::YangInternal)?;
                dtree
                    .merge(&self.operational)
                    .map_err(Error::YangInternal)?;
                dtree
            }
        };

        let mut result = match xpath {
            Some(xpath) => {
                let mut dtree = DataTree::new(self.ctx);
                for dnode in source
                    .find_xpath(xpath)
                    .map_err(Error::YangInternal)?
                {
                    let subtree =
                        dnode.duplicate(true).map_err(Error::YangInternal)?;
                    dtree.merge(&subtree).map_err(Error::YangInternal)?;
                }
                dtree
            }
            None => source,
        };

        self.filter_read(&mut result, user);
        filter_content(&mut result, params.content);
        if let Some(max_depth) = params.max_depth {
            let base_depth =
                xpath.map(|xpath| xpath_depth(xpath)).unwrap_or(0);
            prune_depth(&mut result, base_depth, max_depth);
        }

        Ok(result)
    }

    // Removes every node the user may not read. List keys follow their list
    // entry.
    fn filter_read(&self, dtree: &mut DataTree<'static>, user: &str) {
        if user == self.config.recovery_user {
            return;
        }

        let mut denied = Vec::new();
        for dnode in dtree.traverse() {
            let snode = dnode.schema();
            if snode.is_list_key() {
                continue;
            }
            let module = snode.module().name().to_owned();
            let path = dnode.path();
            if !self.nacm.check(user, Access::Read, &module, Some(&path)) {
                denied.push(path);
            }
        }
        for path in denied {
            if let Ok(Some(mut dnode)) =
                dtree.find_xpath(&path).map(|mut iter| iter.next())
            {
                dnode.remove();
            }
        }
    }

    // Checks write permission for the target of an edit.
    fn check_write(
        &self,
        user: &str,
        access: Access,
        xpath: &str,
    ) -> Result<()> {
        if user == self.config.recovery_user {
            return Ok(());
        }
        let module = xpath_module(xpath).unwrap_or_default();
        if !self.nacm.check(user, access, &module, Some(xpath)) {
            return Err(Error::AccessDenied(xpath.to_owned()));
        }
        Ok(())
    }

    // Applies a single edit as one transaction: work on a copy, validate,
    // swap in on success.
    fn apply_edit(
        &mut self,
        datastore: api::Datastore,
        operation: EditOperation,
        xpath: &str,
        tree: Option<DataTree<'static>>,
        user: &str,
    ) -> Result<EditOutcome> {
        let access = match operation {
            EditOperation::Create => Access::Create,
            EditOperation::Delete | EditOperation::Remove => Access::Delete,
            EditOperation::Merge | EditOperation::Replace => Access::Update,
        };
        if !xpath.is_empty() {
            self.check_write(user, access, xpath)?;
        } else if let Some(tree) = &tree {
            // Whole-datastore edits are checked per top-level node.
            for dnode in
                tree.traverse().filter(|dnode| dnode.parent().is_none())
            {
                self.check_write(user, access, &dnode.path())?;
            }
        }

        // Replacing the whole datastore swaps the tree wholesale; every
        // other edit works on a copy of the current contents.
        let (mut candidate, outcome) = if xpath.is_empty()
            && operation == EditOperation::Replace
        {
            let tree = tree.ok_or_else(missing_edit_value)?;
            (tree, EditOutcome { created: false })
        } else {
            let mut candidate = self
                .datastore_tree(datastore)
                .duplicate()
                .map_err(Error::YangInternal)?;
            let outcome =
                edit_tree(&mut candidate, operation, xpath, tree.as_ref())?;
            (candidate, outcome)
        };
        candidate
            .validate(DataValidationFlags::NO_STATE)
            .map_err(|error| Error::Validation(error.to_string()))?;
        *self.datastore_tree_mut(datastore) = candidate;
        self.reload_nacm(datastore);

        Ok(outcome)
    }

    // Applies a YANG-Patch edit list in one transaction. The edit-id of the
    // offending edit accompanies any error.
    fn apply_patch(
        &mut self,
        datastore: api::Datastore,
        edits: Vec<PatchEdit>,
        user: &str,
    ) -> std::result::Result<(), (String, Error)> {
        let mut candidate = self
            .datastore_tree(datastore)
            .duplicate()
            .map_err(|error| {
                (String::new(), Error::YangInternal(error))
            })?;

        for edit in &edits {
            let access = match edit.operation {
                EditOperation::Create => Access::Create,
                EditOperation::Delete | EditOperation::Remove => {
                    Access::Delete
                }
                EditOperation::Merge | EditOperation::Replace => {
                    Access::Update
                }
            };
            self.check_write(user, access, &edit.xpath)
                .map_err(|error| (edit.edit_id.clone(), error))?;
            edit_tree(
                &mut candidate,
                edit.operation,
                &edit.xpath,
                edit.tree.as_ref(),
            )
            .map_err(|error| (edit.edit_id.clone(), error))?;
        }

        candidate
            .validate(DataValidationFlags::NO_STATE)
            .map_err(|error| {
                (String::new(), Error::Validation(error.to_string()))
            })?;
        *self.datastore_tree_mut(datastore) = candidate;
        self.reload_nacm(datastore);
        Ok(())
    }

    fn invoke_rpc(
        &mut self,
        xpath: &str,
        input: &DataTree<'static>,
        user: &str,
    ) -> Result<DataTree<'static>> {
        if user != self.config.recovery_user {
            let module = xpath_module(xpath).unwrap_or_default();
            if !self.nacm.check(user, Access::Exec, &module, Some(xpath)) {
                return Err(Error::AccessDenied(xpath.to_owned()));
            }
        }

        let handler = self
            .rpc_handlers
            .get(xpath)
            .ok_or_else(|| Error::RpcNotFound(xpath.to_owned()))?;
        handler(self.ctx, input)
    }

    // Serializes a notification once per encoding and fans it out to the
    // firehose, the replay buffer and every matching subscription.
    fn publish_notification(
        &mut self,
        tree: DataTree<'static>,
    ) -> Result<()> {
        let Some(dnode) = tree.traverse().next() else {
            return Err(Error::BadInput("empty notification".to_owned()));
        };
        let path = dnode.path();
        let json = tree
            .print_string(DataFormat::JSON, DataPrinterFlags::WITH_SIBLINGS)
            .map_err(Error::YangInternal)?;
        let xml = tree
            .print_string(DataFormat::XML, DataPrinterFlags::WITH_SIBLINGS)
            .map_err(Error::YangInternal)?;

        let notification =
            Arc::new(Notification::new(Utc::now(), path, json, xml));

        self.replay.push_back(notification.clone());
        while self.replay.len() > self.config.replay_buffer_size {
            self.replay.pop_front();
            self.replay_trimmed = true;
        }

        // Nobody listening on the firehose is fine.
        let _ = self.notif_tx.send(notification.clone());

        for (id, subscription) in self.subscriptions.iter() {
            if !subscription.matches(&notification.path) {
                continue;
            }
            if let Err(error) = subscription
                .tx
                .try_send(EngineEvent::Notification(notification.clone()))
            {
                warn!(%id, %error, "dropping notification for slow subscriber");
            }
        }

        Ok(())
    }

    fn subscribe(
        &mut self,
        stream: String,
        xpath_filter: Option<String>,
        stop_time: Option<DateTime<Utc>>,
        replay_start: Option<DateTime<Utc>>,
    ) -> Result<SubscribeResponse> {
        if stream != "NETCONF" {
            return Err(Error::UnknownStream(stream));
        }

        let now = Utc::now();
        if let Some(stop) = stop_time {
            if stop <= now {
                return Err(Error::BadInput(
                    "stop-time must be in the future".to_owned(),
                ));
            }
            if let Some(start) = replay_start {
                if stop <= start {
                    return Err(Error::BadInput(
                        "stop-time must follow replay-start-time".to_owned(),
                    ));
                }
            }
        }
        if let Some(start) = replay_start {
            if start > now {
                return Err(Error::BadInput(
                    "replay-start-time must not be in the future".to_owned(),
                ));
            }
        }

        let id = self.next_subscription_id;
        self.next_subscription_id += 1;

        let (tx, rx) =
            mpsc::channel(self.config.subscription_queue_size);

        // Replay buffered events, adjusting the start when history no longer
        // reaches back far enough.
        let mut replay_start_revision = None;
        if let Some(start) = replay_start {
            let horizon = if self.replay_trimmed {
                self.replay
                    .front()
                    .map(|notification| notification.time)
                    .unwrap_or(self.replay_started)
            } else {
                self.replay_started
            };
            if start < horizon {
                replay_start_revision = Some(horizon);
            }
            for notification in self
                .replay
                .iter()
                .filter(|notification| notification.time >= start)
            {
                let _ = tx.try_send(EngineEvent::Notification(
                    notification.clone(),
                ));
            }
        }

        let stop = stop_time.map(|stop| {
            let delay = (stop - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            let self_tx = self.self_tx.clone();
            TimeoutTask::new(delay, move || async move {
                let _ = self_tx
                    .send(Request::Terminate(api::TerminateRequest {
                        id,
                        reason: None,
                        responder: None,
                    }))
                    .await;
            })
        });

        self.subscriptions.insert(
            id,
            EngineSubscription {
                tx,
                xpath_filter,
                _stop: stop,
            },
        );
        info!(%id, "notification subscription established");

        Ok(SubscribeResponse {
            id,
            events: rx,
            replay_start_revision,
        })
    }

    fn terminate_subscription(
        &mut self,
        id: u32,
        reason: Option<String>,
    ) -> Result<()> {
        let subscription = self
            .subscriptions
            .remove(&id)
            .ok_or(Error::SubscriptionNotFound(id))?;
        debug!(%id, reason = reason.as_deref().unwrap_or("<stop-time>"),
            "terminating subscription");
        let _ = subscription.tx.try_send(EngineEvent::Terminated { reason });
        Ok(())
    }

    fn module_text(
        &self,
        name: &str,
        revision: Option<&str>,
    ) -> Option<String> {
        let module = self.ctx.get_module(name, revision)?;
        if let Some(requested) = revision {
            if module.revision() != Some(requested) {
                return None;
            }
        }
        let key = match module.revision() {
            Some(revision) => format!("{}@{}", name, revision),
            None => name.to_owned(),
        };
        self.module_sources
            .get(&key)
            .or_else(|| self.module_sources.get(name))
            .cloned()
    }

    fn datastore_tree(&self, datastore: api::Datastore) -> &DataTree<'static> {
        match datastore {
            api::Datastore::Running => &self.running,
            api::Datastore::Startup => &self.startup,
            api::Datastore::Candidate => &self.candidate,
            api::Datastore::Operational => &self.operational,
        }
    }

    fn datastore_tree_mut(
        &mut self,
        datastore: api::Datastore,
    ) -> &mut DataTree<'static> {
        match datastore {
            api::Datastore::Running => &mut self.running,
            api::Datastore::Startup => &mut self.startup,
            api::Datastore::Candidate => &mut self.candidate,
            api::Datastore::Operational => &mut self.operational,
        }
    }

    // Republishes the access-control rules after a running-datastore change.
    fn reload_nacm(&mut self, datastore: api::Datastore) {
        if datastore != api::Datastore::Running {
            return;
        }
        let nacm = Arc::new(NacmRules::from_data(&self.running));
        self.nacm = nacm.clone();
        self.nacm_tx.send_replace(nacm);
    }
}

struct EditOutcome {
    created: bool,
}

// ===== impl EngineSubscription =====

impl EngineSubscription {
    fn matches(&self, path: &str) -> bool {
        match &self.xpath_filter {
            Some(filter) => path.starts_with(filter.as_str()),
            None => true,
        }
    }
}

// ===== helper functions =====

// Applies one edit operation to a candidate tree.
fn edit_tree(
    candidate: &mut DataTree<'static>,
    operation: EditOperation,
    xpath: &str,
    tree: Option<&DataTree<'static>>,
) -> Result<EditOutcome> {
    let existing = find_one(candidate, xpath);

    match operation {
        EditOperation::Create => {
            if let Some((path, is_default)) = existing {
                if !is_default {
                    return Err(Error::ItemExists(path));
                }
            }
            let tree = tree.ok_or_else(missing_edit_value)?;
            candidate.merge(tree).map_err(Error::YangInternal)?;
            Ok(EditOutcome { created: true })
        }
        EditOperation::Replace => {
            let existed = existing.is_some();
            if let Some((path, _)) = existing {
                if let Ok(Some(mut dnode)) = candidate
                    .find_xpath(&path)
                    .map(|mut iter| iter.next())
                {
                    dnode.remove();
                }
            }
            let tree = tree.ok_or_else(missing_edit_value)?;
            candidate.merge(tree).map_err(Error::YangInternal)?;
            Ok(EditOutcome { created: !existed })
        }
        EditOperation::Merge => {
            let tree = tree.ok_or_else(missing_edit_value)?;
            candidate.merge(tree).map_err(Error::YangInternal)?;
            Ok(EditOutcome { created: false })
        }
        EditOperation::Delete | EditOperation::Remove => {
            match existing {
                Some((path, is_default)) => {
                    if is_default && operation == EditOperation::Delete {
                        return Err(Error::DefaultValue(path));
                    }
                    if let Ok(Some(mut dnode)) = candidate
                        .find_xpath(&path)
                        .map(|mut iter| iter.next())
                    {
                        dnode.remove();
                    }
                }
                None => {
                    if operation == EditOperation::Delete {
                        return Err(Error::ItemNotFound(xpath.to_owned()));
                    }
                }
            }
            Ok(EditOutcome { created: false })
        }
    }
}

fn find_one(
    dtree: &DataTree<'static>,
    xpath: &str,
) -> Option<(String, bool)> {
    if xpath.is_empty() {
        return None;
    }
    dtree
        .find_xpath(xpath)
        .ok()
        .and_then(|mut iter| iter.next())
        .map(|dnode| (dnode.path(), dnode.is_default()))
}

fn missing_edit_value() -> Error {
    Error::BadInput("edit operation requires a value".to_owned())
}

// Prunes nodes that don't pass the `content` filter. Containers emptied by
// the filter are dropped as well, except list keys which follow their entry.
fn filter_content(dtree: &mut DataTree<'static>, content: ContentFilter) {
    if content == ContentFilter::All {
        return;
    }

    let mut denied = Vec::new();
    for dnode in dtree.traverse() {
        let snode = dnode.schema();
        let keep = match content {
            ContentFilter::Config => snode.is_config(),
            ContentFilter::Nonconfig => {
                !snode.is_config()
                    || snode.is_list_key()
                    || matches!(
                        snode.kind(),
                        SchemaNodeKind::Container | SchemaNodeKind::List
                    )
            }
            ContentFilter::All => true,
        };
        if !keep {
            denied.push(dnode.path());
        }
    }
    for path in denied {
        if let Ok(Some(mut dnode)) =
            dtree.find_xpath(&path).map(|mut iter| iter.next())
        {
            dnode.remove();
        }
    }

    // Drop structural nodes left without any state below them.
    if content == ContentFilter::Nonconfig {
        loop {
            let mut empty = Vec::new();
            for dnode in dtree.traverse() {
                let snode = dnode.schema();
                if snode.is_config()
                    && matches!(
                        snode.kind(),
                        SchemaNodeKind::Container | SchemaNodeKind::List
                    )
                    && dnode
                        .children()
                        .all(|child| child.schema().is_list_key())
                {
                    empty.push(dnode.path());
                }
            }
            if empty.is_empty() {
                break;
            }
            for path in empty {
                if let Ok(Some(mut dnode)) =
                    dtree.find_xpath(&path).map(|mut iter| iter.next())
                {
                    dnode.remove();
                }
            }
        }
    }
}

// Limits the response to `max_depth` levels, the requested node being
// level one.
fn prune_depth(dtree: &mut DataTree<'static>, base_depth: u32, max_depth: u32) {
    let first_level = base_depth.max(1);
    let mut pruned = Vec::new();
    for dnode in dtree.traverse() {
        let mut depth = 1u32;
        let mut parent = dnode.parent();
        while let Some(dnode) = parent {
            depth += 1;
            parent = dnode.parent();
        }
        if depth > first_level + max_depth - 1 {
            pruned.push(dnode.path());
        }
    }
    for path in pruned {
        if let Ok(Some(mut dnode)) =
            dtree.find_xpath(&path).map(|mut iter| iter.next())
        {
            dnode.remove();
        }
    }
}

// Number of path segments, ignoring separators inside key predicates.
fn xpath_depth(xpath: &str) -> u32 {
    let mut depth = 0;
    let mut in_predicate = false;
    let mut quote = None;
    for ch in xpath.chars() {
        match ch {
            '\'' | '"' => match quote {
                Some(current) if current == ch => quote = None,
                Some(_) => (),
                None => quote = Some(ch),
            },
            '[' if quote.is_none() => in_predicate = true,
            ']' if quote.is_none() => in_predicate = false,
            '/' if quote.is_none() && !in_predicate => depth += 1,
            _ => (),
        }
    }
    depth
}

// Module name of the first segment of a canonical path.
fn xpath_module(xpath: &str) -> Option<String> {
    let rest = xpath.strip_prefix('/')?;
    let end = rest.find(['/', ':', '['])?;
    if rest.as_bytes().get(end) == Some(&b':') {
        Some(rest[..end].to_owned())
    } else {
        None
    }
}

// Reads the initial running configuration from disk.
fn load_startup_config(
    ctx: &'static Context,
    path: &str,
) -> Result<DataTree<'static>> {
    let data = std::fs::read_to_string(path)
        .map_err(|error| Error::BadInput(error.to_string()))?;
    let format = if path.ends_with(".xml") {
        DataFormat::XML
    } else {
        DataFormat::JSON
    };
    DataTree::parse_string(
        ctx,
        &data,
        format,
        DataParserFlags::empty(),
        DataValidationFlags::NO_STATE,
    )
    .map_err(Error::YangInternal)
}

// Locates the raw sources of every loaded module, embedded or on-disk, so
// the schema endpoint can serve them.
fn load_module_sources(
    ctx: &'static Context,
    config: &EngineConfig,
) -> HashMap<String, String> {
    let mut sources = HashMap::new();

    for (name, revision, text) in vireo_yang::embedded_module_sources() {
        match revision {
            Some(revision) => {
                sources
                    .insert(format!("{}@{}", name, revision), text.to_owned());
            }
            None => {
                sources.insert(name.to_owned(), text.to_owned());
            }
        }
    }

    for module in ctx.modules(true) {
        let name = module.name();
        let key = match module.revision() {
            Some(revision) => format!("{}@{}", name, revision),
            None => name.to_owned(),
        };
        if sources.contains_key(&key) {
            continue;
        }
        for dir in &config.yang_search_dirs {
            let candidates = [
                format!("{}/{}.yang", dir, key),
                format!("{}/{}.yang", dir, name),
            ];
            for candidate in candidates {
                if let Ok(text) = std::fs::read_to_string(&candidate) {
                    sources.insert(key.clone(), text);
                    break;
                }
            }
            if sources.contains_key(&key) {
                break;
            }
        }
    }

    sources
}

// Populates the operational datastore with the module inventory
// (RFC 8525 plus the deprecated RFC 7895 subtree).
fn init_yang_library(
    ctx: &'static Context,
    operational: &mut DataTree<'static>,
) -> std::result::Result<(), yang3::Error> {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let prefix =
        "/ietf-yang-library:yang-library/module-set[name='complete']";
    let mut hasher = DefaultHasher::new();

    for module in ctx.modules(true) {
        let name = module.name();
        let revision = module.revision().unwrap_or_default();
        name.hash(&mut hasher);
        revision.hash(&mut hasher);

        let entry = if module.is_implemented() {
            format!("{}/module[name='{}']", prefix, name)
        } else {
            format!(
                "{}/import-only-module[name='{}'][revision='{}']",
                prefix, name, revision
            )
        };
        operational.new_path(
            &format!("{}/namespace", entry),
            Some(module.namespace()),
            false,
        )?;
        if module.is_implemented() && !revision.is_empty() {
            operational.new_path(
                &format!("{}/revision", entry),
                Some(revision),
                false,
            )?;
        }
        operational.new_path(
            &format!("{}/location", entry),
            Some("/yang/"),
            false,
        )?;

        // Deprecated modules-state tree, still expected by many clients.
        let state_entry = format!(
            "/ietf-yang-library:modules-state/module[name='{}'][revision='{}']",
            name, revision
        );
        operational.new_path(
            &format!("{}/namespace", state_entry),
            Some(module.namespace()),
            false,
        )?;
        operational.new_path(
            &format!("{}/conformance-type", state_entry),
            Some(if module.is_implemented() {
                "implement"
            } else {
                "import"
            }),
            false,
        )?;
        operational.new_path(
            &format!("{}/schema", state_entry),
            Some("/yang/"),
            false,
        )?;
    }

    let content_id = format!("{:x}", hasher.finish());
    operational.new_path(
        "/ietf-yang-library:yang-library/content-id",
        Some(&content_id),
        false,
    )?;
    operational.new_path(
        "/ietf-yang-library:modules-state/module-set-id",
        Some(&content_id),
        false,
    )?;

    Ok(())
}
