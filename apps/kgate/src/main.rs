use kgate_core::bootstrap_from_env;
use kgate_router::{ProxyState, proxy_router};
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("kgate failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let boot = bootstrap_from_env().await?;
    // Tokenizer tables load lazily; pay for them before the first request.
    kgate_transform::tokens::preload();

    let app = proxy_router(ProxyState {
        orchestrator: boot.orchestrator,
        authenticator: boot.authenticator,
    });

    let addr = boot.global.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    boot.metadata_task.abort();
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "kgate=info,kgate_core=info,kgate_router=info,kgate_provider_core=info",
        )
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}
