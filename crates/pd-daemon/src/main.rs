//! port-daddy daemon — binds the Unix-domain socket and the loopback TCP
//! listener, then serves the coordination API until signaled.

use anyhow::{Context, Result};
use tracing::info;

use pd_core::config::Config;
use pd_daemon::daemon::Daemon;
use pd_daemon::lockfile::DaemonLockfile;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default(".").context("failed to load configuration")?;
    pd_telemetry::logging::init_logging(
        "port-daddy",
        &config.logging.level,
        config.logging.silent,
    );

    // --- Startup guard: refuse to double-start unless --replace ---
    let replace_mode = std::env::args().any(|a| a == "--replace" || a == "-r");
    if let Some(existing) = DaemonLockfile::read_valid() {
        if replace_mode {
            info!(pid = existing.pid, "replacing existing daemon (--replace)");
            #[cfg(unix)]
            unsafe {
                libc::kill(existing.pid as i32, libc::SIGTERM);
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            DaemonLockfile::remove();
        } else {
            eprintln!(
                "port-daddy daemon already running (pid={}, socket={})\n\
                 \n  Hint: use --replace to restart it.",
                existing.pid, existing.socket_path,
            );
            std::process::exit(1);
        }
    }

    let daemon = Daemon::new(config.clone()).await?;

    // --- Bind listeners: socket first, TCP unless disabled ---
    let socket_path = config.service.socket_path.clone();
    let _ = std::fs::remove_file(&socket_path); // stale socket from a crash
    let unix_listener = tokio::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind unix socket at {socket_path}"))?;
    info!(path = %socket_path, "unix socket bound");

    let tcp_listener = if config.service.tcp_enabled {
        let addr = format!("{}:{}", config.service.host, config.service.tcp_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind tcp listener on {addr}"))?;
        info!(addr = %addr, "tcp listener bound");
        Some(listener)
    } else {
        info!("tcp listener disabled");
        None
    };

    // --- Lockfile after both listeners are known ---
    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        tcp_port: tcp_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port()),
        socket_path: socket_path.clone(),
        host: config.service.host.clone(),
        started_at: unix_now_ms(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(msg) = lockfile.acquire_or_fail() {
        eprintln!("failed to acquire lockfile: {msg}");
        std::process::exit(1);
    }

    // --- Signals trigger graceful shutdown ---
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, initiating shutdown");
        DaemonLockfile::remove();
        shutdown.trigger();
    });

    let result = daemon.run(unix_listener, tcp_listener).await;
    DaemonLockfile::remove();
    result
}

fn unix_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
