// Calwire Linux: Calibre wireless device daemon (discovery, session, book storage).

mod config;
mod events;
mod host;

use anyhow::Context;
use calwire_core::CancelToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("calwire-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calwire_linux=info,calwire_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load();
    info!(
        version = VERSION,
        books_root = %cfg.books_root.display(),
        device = %cfg.device_name,
        "starting"
    );

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let shutdown = CancelToken::new();
    let conn = host::build_connection(&cfg, shutdown.clone())?;
    let session_cancel = conn.cancel_token();

    let stop = shutdown.clone();
    let mut session = tokio::task::spawn_blocking(move || host::run(conn, &cfg, &stop));

    tokio::select! {
        res = &mut session => {
            let books = res.context("session thread panicked")??;
            info!(books, "session loop ended");
            return Ok(());
        }
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
            shutdown.cancel();
            session_cancel.cancel();
        }
    }

    let books = session.await.context("session thread panicked")??;
    info!(books, "stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
