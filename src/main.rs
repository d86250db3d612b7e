use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use relaybridge::config::{load_config, AppConfig, ServerConfig};
use relaybridge::observability::init_tracing;
use relaybridge::routing::dispatch::{dispatch_request, normalize_base_path};
use relaybridge::state::{AppState, SharedServices};
#[cfg(unix)]
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

const LISTEN_BACKLOG: i32 = 1024;
const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const CONFIG_PATH_ENV: &str = "RELAYBRIDGE_CONFIG";

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration from '{config_path}': {err}");
            eprintln!("Copy 'config.example.yaml' to '{DEFAULT_CONFIG_PATH}' or set {CONFIG_PATH_ENV}.");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.features.log_level);
    let runtime = match build_runtime(&config.server) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to initialize Tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!("{message}");
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn build_runtime(server: &ServerConfig) -> io::Result<tokio::runtime::Runtime> {
    let single_threaded = server.runtime_worker_threads == Some(1);
    let mut builder = if single_threaded {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = server.runtime_worker_threads {
            builder.worker_threads(threads);
        }
        if let Some(stack_kb) = server.runtime_thread_stack_size_kb {
            builder.thread_stack_size(stack_kb * 1024);
        }
        builder
    };
    builder.enable_io().enable_time();
    if let Some(max_blocking) = server.runtime_max_blocking_threads {
        builder.max_blocking_threads(max_blocking);
    }
    builder.build()
}

async fn run(config: AppConfig) -> Result<(), String> {
    let base_path: Arc<str> = Arc::from(normalize_base_path(&config.server.base_path));
    let cleanup_every = Duration::from_secs(config.features.metrics_cleanup_interval_secs.max(1));

    let services = SharedServices::from_config(&config);
    let metrics_cleanup = services.metrics.spawn_cleanup(cleanup_every);
    let state = AppState::new(config, services)
        .map(Arc::new)
        .map_err(|err| format!("Failed to initialize channels: {err}"))?;

    let server = &state.config.server;
    let listeners = ListenerSet::bind(server)
        .await
        .map_err(|err| format!("Failed to bind to {}:{}: {err}", server.host, server.port))?;
    tracing::info!(
        host = %server.host,
        port = server.port,
        base_path = %base_path,
        channels = state.channels.len(),
        models = state.model_router.model_names().len(),
        listeners = listeners.sockets.len(),
        reuse_port = listeners.reuse_port,
        "relaybridge is accepting connections"
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    let mut accept_loops = JoinSet::new();
    for listener in listeners.sockets {
        accept_loops.spawn(accept_connections(
            listener,
            conn_builder.clone(),
            Arc::clone(&state),
            Arc::clone(&base_path),
        ));
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::warn!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested, no longer accepting connections");
        }
        _ = accept_loops.join_next() => {
            tracing::error!("accept loop exited unexpectedly");
        }
    }
    accept_loops.abort_all();
    metrics_cleanup.abort();
    Ok(())
}

async fn accept_connections(
    listener: TcpListener,
    conn_builder: AutoBuilder<TokioExecutor>,
    state: Arc<AppState>,
    base_path: Arc<str>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%remote_addr, error = %err, "failed to enable TCP_NODELAY");
        }

        let state = Arc::clone(&state);
        let base_path = Arc::clone(&base_path);
        let service = service_fn(move |request: Request<Incoming>| {
            dispatch_request(
                Arc::clone(&state),
                Arc::clone(&base_path),
                request.map(Body::new),
            )
        });
        let conn_builder = conn_builder.clone();
        tokio::spawn(async move {
            if let Err(err) = conn_builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(%remote_addr, "connection closed with error: {err:#}");
            }
        });
    }
}

/// Bound listening sockets, several when SO_REUSEPORT sharding is on.
struct ListenerSet {
    sockets: Vec<TcpListener>,
    reuse_port: bool,
}

impl ListenerSet {
    async fn bind(server: &ServerConfig) -> io::Result<Self> {
        let requested = server.tcp_reuse_port_listener_count.map(|count| count.max(1));
        let count = match requested {
            Some(count) if cfg!(unix) => count,
            Some(_) => {
                tracing::warn!(
                    "server.tcp_reuse_port_listener_count needs SO_REUSEPORT; using one listener"
                );
                1
            }
            None => 1,
        };

        if count == 1 {
            let socket = TcpListener::bind((server.host.as_str(), server.port)).await?;
            return Ok(Self {
                sockets: vec![socket],
                reuse_port: false,
            });
        }
        let sockets = (0..count)
            .map(|_| bind_reuse_port(&server.host, server.port))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            sockets,
            reuse_port: true,
        })
    }
}

#[cfg(unix)]
fn bind_reuse_port(host: &str, port: u16) -> io::Result<TcpListener> {
    let mut last_err = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no bindable socket address for {host}:{port}"),
    );
    for addr in (host, port).to_socket_addrs()? {
        match bind_reuse_port_addr(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

#[cfg(unix)]
fn bind_reuse_port_addr(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[cfg(not(unix))]
fn bind_reuse_port(_host: &str, _port: u16) -> io::Result<TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_REUSEPORT is only supported on Unix-like platforms",
    ))
}
