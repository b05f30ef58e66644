//! linknest: save links, let an LLM describe and group them.

use std::sync::Arc;

use clap::Parser;
use linknest::engine::EngineConfig;
use linknest::{ai, api, db, AppState, SharedDB};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linknest", version, about = "Link collection with AI descriptions and grouping")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3918", env = "LINKNEST_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "linknest.db", env = "LINKNEST_DB")]
    db: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let shared: SharedDB = Arc::new(db::LinkDB::open(&args.db)?);

    let ai_cfg = ai::AiConfig::from_env();
    let ai_status = match &ai_cfg {
        Some(cfg) if cfg.has_llm() => format!(
            "llm={} describe={} group={}",
            cfg.llm_model,
            cfg.model_for("describe"),
            cfg.model_for("group")
        ),
        _ => "disabled".into(),
    };

    let api_key = std::env::var("LINKNEST_API_KEY").ok().filter(|k| !k.is_empty());
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let config = EngineConfig::from_env();
    info!(
        free_limit = config.free_limit,
        describe_concurrency = config.describe_concurrency,
        "engine configured"
    );

    let state = AppState::new(shared, ai_cfg, config, api_key);

    let idle_mins: u64 = std::env::var("LINKNEST_SESSION_IDLE_MINS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    if idle_mins > 0 {
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            let max_idle = std::time::Duration::from_secs(idle_mins.saturating_mul(60));
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                let evicted = sessions.evict_idle(max_idle);
                if evicted > 0 {
                    info!(evicted, live = sessions.live_count(), "idle sessions dropped");
                }
            }
        });
        info!(idle_mins, "session eviction enabled");
    }

    let app = api::router(state);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %args.db,
        ai = %ai_status,
        auth = auth_status,
        "linknest starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutting down");
}
