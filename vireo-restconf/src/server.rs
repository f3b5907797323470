//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{any, get};
use http::HeaderValue;
use http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use vireo_datastore::DatastoreHandle;
use vireo_datastore::nacm::NacmRules;

use crate::auth::{AuthGate, Authenticator};
use crate::handlers;
use crate::subscriptions::SubscriptionManager;

/// Gateway tuning knobs; every value has a usable default.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Interval of SSE keep-alive comment frames.
    pub keepalive_interval: Duration,
    /// How long a dynamic subscription survives without a receiver.
    pub inactivity_timeout: Duration,
    /// Events drained per subscription wake.
    pub max_events_per_wake: usize,
    /// Root of the stream URLs handed out by establish-subscription.
    pub stream_root: String,
    /// Prefix of the schema-retrieval URLs.
    pub yang_url_prefix: String,
    /// The NACM recovery user.
    pub recovery_user: String,
}

/// Shared state of all request handlers. One instance per server, so tests
/// can run several gateways side by side.
pub struct AppState {
    pub handle: DatastoreHandle,
    pub auth: AuthGate,
    pub subscriptions: Arc<SubscriptionManager>,
    pub shutdown: broadcast::Sender<()>,
    pub options: ServerOptions,
}

/// The RESTCONF gateway itself.
pub struct Server {
    state: Arc<AppState>,
}

// ===== impl ServerOptions =====

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            keepalive_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(60),
            max_events_per_wake: 50,
            stream_root: "/streams/".to_owned(),
            yang_url_prefix: "/yang/".to_owned(),
            recovery_user: "root".to_owned(),
        }
    }
}

// ===== impl Server =====

impl Server {
    pub fn new(
        handle: DatastoreHandle,
        nacm_rx: watch::Receiver<Arc<NacmRules>>,
        authenticator: Option<Arc<dyn Authenticator>>,
        options: ServerOptions,
    ) -> Server {
        let (shutdown, _) = broadcast::channel(8);

        let subscriptions = SubscriptionManager::new(
            handle.clone(),
            options.stream_root.clone(),
            options.inactivity_timeout,
            options.max_events_per_wake,
            options.recovery_user.clone(),
        );
        let auth = AuthGate::new(authenticator, nacm_rx);

        Server {
            state: Arc::new(AppState {
                handle,
                auth,
                subscriptions,
                shutdown,
                options,
            }),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Builds the HTTP routing table.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/restconf", any(handlers::restconf))
            .route("/restconf/*path", any(handlers::restconf))
            .route(
                "/streams/NETCONF/:encoding",
                get(handlers::netconf_stream),
            )
            .route(
                "/streams/subscribed/:uuid",
                get(handlers::subscribed_stream),
            )
            .route("/yang/*module", any(handlers::yang_schema))
            .layer(SetResponseHeaderLayer::overriding(
                ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serves until [`Server::stop`] fires.
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");

        let mut shutdown = self.state.shutdown.subscribe();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
    }

    /// Broadcasts the termination signal to every live stream and tears
    /// down all dynamic subscriptions.
    pub async fn stop(&self) {
        info!("shutting down");
        let _ = self.state.shutdown.send(());
        self.state.subscriptions.stop().await;
    }
}
