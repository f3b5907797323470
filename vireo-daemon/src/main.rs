//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use config::{Config, LoggingFileRotation, LoggingFmtStyle};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;
use vireo_datastore::{DatastoreEngine, EngineConfig};
use vireo_restconf::auth::Authenticator;
use vireo_restconf::{Server, ServerOptions};
use vireo_utils::task::Task;

fn init_tracing(config: &config::Logging) {
    // Enable logging to journald.
    let journald = config.journald.enabled.then(|| {
        tracing_journald::layer().expect("couldn't connect to journald")
    });

    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };

        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(false)
            .with_thread_ids(config.file.fmt.show_thread_id)
            .with_file(config.file.fmt.show_source)
            .with_line_number(config.file.fmt.show_source)
            .with_ansi(config.file.fmt.colors);
        let layer = match config.file.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(config.stdout.fmt.show_thread_id)
            .with_file(config.stdout.fmt.show_source)
            .with_line_number(config.stdout.fmt.show_source)
            .with_ansi(config.stdout.fmt.colors);
        let layer = match config.stdout.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("vireo=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(journald)
        .with(file)
        .with(stdout)
        .init();
}

#[cfg(feature = "pam")]
fn authenticator(config: &config::Auth) -> Option<Arc<dyn Authenticator>> {
    let delay = (config.failure_delay_seconds > 0)
        .then(|| Duration::from_secs(config.failure_delay_seconds));
    Some(Arc::new(vireo_restconf::auth::pam::PamAuthenticator::new(
        config.pam_service.clone(),
        delay,
    )))
}

#[cfg(not(feature = "pam"))]
fn authenticator(_config: &config::Auth) -> Option<Arc<dyn Authenticator>> {
    // Without PAM support only anonymous access works.
    None
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = sigterm.recv() => (),
    }
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("Vireo RESTCONF gateway")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    // Initialize tracing.
    init_tracing(&config.logging);

    // Set panic handler to abort the process if any child task panics.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // We're ready to go!
    info!("starting up");

    let main = async {
        // Start the datastore engine.
        let engine_config = EngineConfig {
            yang_search_dirs: config.yang.search_dirs.clone(),
            yang_modules: config.yang.modules.clone(),
            startup_config_path: config.yang.startup_config.clone(),
            recovery_user: config.auth.recovery_user.clone(),
            ..Default::default()
        };
        let (engine, handle, nacm_rx) = DatastoreEngine::init(engine_config);

        // Start the gateway.
        let options = ServerOptions {
            keepalive_interval: Duration::from_secs(
                config.streams.keepalive_interval_seconds,
            ),
            inactivity_timeout: Duration::from_secs(
                config.streams.inactivity_timeout_seconds,
            ),
            max_events_per_wake: config.streams.max_events_per_wake,
            stream_root: config.streams.url_root.clone(),
            recovery_user: config.auth.recovery_user.clone(),
            ..Default::default()
        };
        let server = Arc::new(Server::new(
            handle,
            nacm_rx,
            authenticator(&config.auth),
            options,
        ));

        let engine_shutdown = server.state().shutdown.subscribe();
        let mut engine_task = Task::spawn(engine.run(engine_shutdown));
        engine_task.detach();

        let addr: SocketAddr = format!(
            "[{}]:{}",
            config.server.address, config.server.port
        )
        .parse()
        .unwrap_or_else(|_| {
            format!("{}:{}", config.server.address, config.server.port)
                .parse()
                .expect("invalid listen address")
        });

        let serve_task = {
            let server = server.clone();
            Task::spawn(async move {
                if let Err(error) = server.serve(addr).await {
                    error!(%error, "server error");
                }
            })
        };

        // Run until asked to stop, then shut down within the deadline.
        shutdown_signal().await;
        server.stop().await;
        if tokio::time::timeout(Duration::from_secs(5), serve_task)
            .await
            .is_err()
        {
            error!("graceful shutdown timed out");
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.worker_threads)
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(main);
}
