//! RTSP-to-WebSocket media proxy.
//!
//! Ingests the streams named in a YAML config, runs each through its filter
//! chain on a dedicated worker thread, and fans the resulting packets out to
//! WebSocket subscribers.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use strand_media::worker::{EventSink, IngestWorker, PublishSink, StreamEvent, WorkerConfig};

mod config;
mod hub;
mod server;
mod session;

use config::Config;
use hub::StreamHub;

#[derive(Parser)]
#[command(about = "RTSP-to-WebSocket media proxy")]
struct Args {
    /// Path of the YAML configuration.
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Load config fail: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("can't build runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let default_filter = config.log.level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    strand_media::init().context("ffmpeg init")?;

    if config.stream_ui_enable {
        warn!("stream_ui_enable is set, but this build has no on-screen preview");
    }
    if config.server.http.ssl_crt.is_some()
        || config.server.http.ssl_key.is_some()
        || config.server.http.ssl_dh.is_some()
    {
        warn!("ssl_crt/ssl_key/ssl_dh are set, but this build serves plain TCP only");
    }

    let hub = Arc::new(StreamHub::new(config.server.stream.send_queue_max_size));

    let mut workers = Vec::with_capacity(config.streams.len());
    for stream in &config.streams {
        let worker_config = WorkerConfig {
            id: stream.id.clone(),
            source: stream.source.clone(),
            filters: stream.filters.clone(),
            frequency: config.stream_frequency(),
            loop_on_eof: stream.loop_on_eof,
        };
        let events: EventSink = {
            let id = stream.id.clone();
            Box::new(move |e| match e {
                StreamEvent::Open => info!("stream[{}] open ...", id),
                StreamEvent::Opened => info!("stream[{}] open success", id),
                StreamEvent::Loop => info!("stream[{}] eof, reopening", id),
                StreamEvent::Closed => info!("stream[{}] close success", id),
                StreamEvent::Error(err) => error!("stream[{}] {}", id, err),
                _ => {}
            })
        };
        let publish: PublishSink = {
            let hub = hub.clone();
            let id = stream.id.clone();
            Box::new(move |media_type, params, pkt| {
                hub.publish(&id, media_type, params, pkt);
            })
        };
        workers.push(
            IngestWorker::start(worker_config, events, publish)
                .with_context(|| format!("stream[{}]", stream.id))?,
        );
    }

    let ip: IpAddr = config
        .server
        .addr
        .parse()
        .with_context(|| format!("invalid server.addr {:?}", config.server.addr))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("can't bind {}", addr))?;
    info!("listening on {}", addr);

    let router = server::build_router(hub.clone(), &config);
    let serve =
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>());
    if config.server.signal_exit_enable {
        let hub = hub.clone();
        serve
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("shutdown signal received");
                hub.shutdown();
            })
            .await?;
    } else {
        serve.await?;
    }

    info!("stopping {} stream worker(s)", workers.len());
    for worker in &mut workers {
        worker.stop();
    }
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("can't install SIGTERM handler");
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}
