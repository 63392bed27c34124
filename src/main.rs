use anyhow::Context;
use devhost::config::{default_config_path, Config};
use devhost::context::AppContext;
use devhost::proxy::ProxyServer;
use devhost::registry::{AppRegistry, ConfigSource};
use devhost::supervisor::ProcessSupervisor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devhost=debug".parse().expect("valid log directive")),
        )
        .init();

    // An explicit path must exist; the default location is optional
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(explicit_path.as_deref()).map_err(|e| {
        error!(path = ?explicit_path, error = %e, "Failed to load configuration");
        e
    })?;
    let config_path = explicit_path.or_else(default_config_path);
    info!(path = ?config_path, "Configuration loaded");

    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_deref().map(devhost::config::expand_tilde);
    let _pid_file = match pid_file_path {
        Some(ref path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(
        AppRegistry::new(ConfigSource::new(config_path.clone(), &config))
            .context("Failed to load apps")?,
    );
    let supervisor = ProcessSupervisor::new(config.supervisor.clone());
    let ctx = AppContext::new(config.server.clone(), Arc::clone(&registry), Arc::clone(&supervisor));

    let relay_cancel = CancellationToken::new();
    let relay = ctx.spawn_status_relay(relay_cancel.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(addr, Arc::clone(&ctx), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    info!(
        dashboard = %ctx.urls().for_label(&config.server.dashboard_host),
        "Dashboard available"
    );

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or app reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading apps...");
                    match registry.reload() {
                        Ok(count) => {
                            info!(apps = count, "Apps reloaded");
                            ctx.publish_status();
                        }
                        Err(e) => error!(error = %e, "Failed to reload apps"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all processes...");
    supervisor.stop_all().await;
    relay_cancel.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = relay.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open PID file {}", path.display()))?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another devhost instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours, so a running instance keeps its PID
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting devhost");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        advertised_port = config.server.advertised_port,
        tld = %config.server.normalized_tld(),
        dashboard_host = %config.server.dashboard_host,
        apps_dir = ?config.server.apps_dir_path(),
        "Server configuration"
    );
    info!(
        port_range_start = config.supervisor.port_range_start,
        port_range_end = config.supervisor.port_range_end,
        readiness_timeout_secs = config.supervisor.readiness_timeout_secs,
        shell = %config.supervisor.shell_program(),
        "Supervisor settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
}
