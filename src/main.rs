use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use c3::api::{AppState, build_router};
use c3::auth::{ActivationRateLimiter, AuthState, JwtKeys, license};
use c3::config;
use c3::pty::PtyMultiplexer;
use c3::scheduler::Scheduler;
use c3::sessions::SessionManager;
use c3::store::SqliteStore;
use c3::tunnel::TunnelManager;

#[derive(Parser)]
#[command(name = "c3")]
#[command(version)]
#[command(about = "Distributed hub for interactive AI coding agent sessions")]
#[command(long_about = "\
c3 manages a pool of workers (the local machine plus SSH-reachable remotes),
spawns Claude Code CLI sessions on pseudo-terminals, streams their bytes to
browsers over WebSockets, and persists everything in an embedded database.

Sessions queue up against per-worker capacity; idle sessions yield their
slot cooperatively and resume later with their conversation intact.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub
    #[command(after_help = "\
EXAMPLES:
    # Local-only hub on the default port (no auth)
    c3 start

    # Expose on the network: auth is enforced, activate from the browser
    c3 start --host 0.0.0.0 --port 3000

    # HTTPS with a generated certificate
    c3 start --host 0.0.0.0 --tls --self-signed

ENVIRONMENT:
    PORT, HOST          Listener overrides (flags win)
    LOG_LEVEL           Log filter (default: c3=info)
    SCROLLBACK_DIR      Scrollback directory (default: ./scrollback)")]
    Start {
        /// HTTP listener port
        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,

        /// Bind address. Anything other than loopback turns auth on.
        #[arg(long, env = "HOST", default_value = "127.0.0.1")]
        host: String,

        /// Serve HTTPS
        #[arg(long)]
        tls: bool,

        /// TLS certificate path (PEM)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// TLS private key path (PEM)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Generate (once) and use a self-signed certificate
        #[arg(long)]
        self_signed: bool,

        /// Disable authentication even on non-loopback binds
        #[arg(long)]
        no_auth: bool,
    },

    /// Validate a license key offline and store it
    #[command(after_help = "\
EXAMPLES:
    c3 activate 'eyJlbWFpbCI6...'.'MEUCIQ...'

Writes $HOME/.agentide/license.key (mode 0600) on success.")]
    Activate {
        /// The license key
        license_key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Multiple dependencies can register conflicting rustls providers;
    // pick ring explicitly before any TLS or SSH work.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            host,
            tls,
            cert,
            key,
            self_signed,
            no_auth,
        } => {
            initialize_hub_logging()?;
            run_hub(StartOptions {
                port,
                host,
                tls,
                cert,
                key,
                self_signed,
                no_auth,
            })
            .await
        }
        Commands::Activate { license_key } => {
            initialize_cli_logging();
            activate_offline(&license_key)
        }
    }
}

struct StartOptions {
    port: u16,
    host: String,
    tls: bool,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    self_signed: bool,
    no_auth: bool,
}

async fn run_hub(options: StartOptions) -> anyhow::Result<()> {
    tracing::info!("c3 hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("PID: {}", std::process::id());

    // The store opens first; everything else hangs off it.
    let store = Arc::new(SqliteStore::new(&config::database_path()).await?);

    // Auth mode is a function of where we listen.
    let loopback = matches!(options.host.as_str(), "127.0.0.1" | "::1" | "localhost");
    let auth_required = !loopback && !options.no_auth;
    store.set_auth_required(auth_required).await?;
    tracing::info!(host = %options.host, auth_required, "Auth policy derived from bind address");

    // Boot-time license check is informational; activation can still
    // happen through the browser gate.
    if auth_required {
        let license_path = config::license_path();
        if license_path.exists() {
            match std::fs::read_to_string(&license_path) {
                Ok(raw) => match license::validate(raw.trim()) {
                    Ok(payload) => {
                        tracing::info!(email = %payload.email, plan = %payload.plan, "License valid");
                    }
                    Err(e) => tracing::warn!(error = %e, "Stored license failed validation"),
                },
                Err(e) => tracing::warn!(error = %e, "Cannot read stored license"),
            }
        }
    }

    let auth_config = store.get_auth_config().await?;
    let keys = JwtKeys::from_hex_secret(&auth_config.jwt_secret)?;

    let hooks_settings_path = c3::hooks::write_hook_files()?;

    // Wiring: multiplexer events feed the scheduler's lifecycle loop.
    let (lifecycle_tx, lifecycle_rx) = tokio::sync::mpsc::channel(256);
    let dispatch_notify = Arc::new(tokio::sync::Notify::new());

    let tunnel = Arc::new(TunnelManager::new(Arc::clone(&store)));
    let mux = Arc::new(PtyMultiplexer::new(config::scrollback_dir(), lifecycle_tx));
    let launcher = Arc::new(c3::sessions::PtyLauncher::new(
        Arc::clone(&mux),
        Arc::clone(&tunnel),
        options.port,
    ));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&mux),
        Arc::clone(&tunnel),
        launcher,
        Arc::clone(&dispatch_notify),
        hooks_settings_path,
    ));

    // Settle session statuses before the first client can connect.
    sessions.recover_from_crash().await?;

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&mux),
        Arc::clone(&sessions),
        Arc::clone(&dispatch_notify),
    ));
    let _dispatch_task = scheduler.spawn_dispatch_loop();
    let _lifecycle_task = scheduler.spawn_lifecycle_loop(lifecycle_rx);
    let _idle_task = mux.spawn_idle_poller();

    let port_scanner = Arc::new(c3::ports::PortScanner::new(
        Arc::clone(&store),
        Arc::clone(&mux),
        Arc::clone(&tunnel),
    ));
    let _scan_task = port_scanner.spawn();

    // Remote workers connect lazily in the background.
    {
        let store = Arc::clone(&store);
        let tunnel = Arc::clone(&tunnel);
        let notify = Arc::clone(&dispatch_notify);
        tokio::spawn(async move {
            let workers = match store.list_workers().await {
                Ok(workers) => workers,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot list workers for startup connect");
                    return;
                }
            };
            for worker in workers {
                if worker.kind == c3::core::WorkerKind::Remote {
                    if let Err(e) = tunnel.connect(&worker).await {
                        tracing::warn!(worker_id = %worker.id, error = %e, "Startup connect failed");
                    }
                }
            }
            notify.notify_one();
        });
    }

    let auth_state = AuthState {
        store: Arc::clone(&store),
        keys,
        limiter: Arc::new(ActivationRateLimiter::new()),
        auth_required,
        tls_active: options.tls,
    };
    let app_state = AppState {
        store: Arc::clone(&store),
        sessions: Arc::clone(&sessions),
        mux: Arc::clone(&mux),
        tunnel: Arc::clone(&tunnel),
        auth: auth_state,
        dispatch_notify: Arc::clone(&dispatch_notify),
        http_client: AppState::proxy_client(),
    };
    let router = build_router(app_state);

    let addr: SocketAddr = format!("{host}:{port}", host = options.host, port = options.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });
    }

    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    if options.tls {
        let (cert_path, key_path) = match (&options.cert, &options.key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ if options.self_signed => c3::tls::ensure_self_signed()?,
            _ => anyhow::bail!("--tls requires --cert/--key or --self-signed"),
        };
        let tls_config = c3::tls::rustls_config(&cert_path, &key_path).await?;
        tracing::info!(%addr, "Listening (TLS)");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(service)
            .await?;
    } else {
        tracing::info!(%addr, "Listening");
        axum_server::bind(addr).handle(handle).serve(service).await?;
    }

    // Orderly teardown: flush scrollbacks and stop agents, stop the
    // scheduler, drop SSH connections; the store closes with its pool.
    tracing::info!("Shutting down");
    scheduler.shutdown();
    port_scanner.shutdown();
    mux.shutdown().await;
    tunnel.destroy_all().await;
    tracing::info!("Goodbye");
    Ok(())
}

/// Validate a key offline and persist it for the next `start`.
fn activate_offline(license_key: &str) -> anyhow::Result<()> {
    match license::validate(license_key) {
        Ok(payload) => {
            let path = config::license_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, license_key.trim())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            tracing::info!(
                email = %payload.email,
                plan = %payload.plan,
                expires_at = %payload.expires_at,
                path = %path.display(),
                "License activated"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "License rejected");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Console-only logging for one-shot CLI commands.
fn initialize_cli_logging() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "c3=warn".into()),
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
}

/// Console plus file logging for the hub.
fn initialize_hub_logging() -> anyhow::Result<()> {
    let logs_dir = config::logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let log_filename = format!("c3.{timestamp}.log");
    let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);

    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let _ = std::fs::remove_file(logs_dir.join("latest.log"));
        let _ = symlink(&log_filename, logs_dir.join("latest.log"));
    }

    let filter_value = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "c3=info".into());
    let console_filter = tracing_subscriber::EnvFilter::new(&filter_value);
    let file_filter = tracing_subscriber::EnvFilter::new(&filter_value);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .init();

    Ok(())
}
