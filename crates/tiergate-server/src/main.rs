use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use tiergate_core::config::Config;
use tiergate_core::{AccessDecisionEngine, PermissionMatrix, RouteTable};
use tiergate_metadata::TierStore;
use tiergate_server::{sources::providers_from_config, state::AppState};

async fn run_health_check() -> ! {
    let port = std::env::var("TIERGATE_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/health", port);
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

/// Matrix and route table from their JSON files, or the built-in ones.
/// Any validation problem is fatal.
fn load_engine(cfg: &Config) -> Result<AccessDecisionEngine> {
    let matrix = match &cfg.matrix_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading permission matrix {path}"))?;
            PermissionMatrix::from_json_str(&raw)?
        }
        None => PermissionMatrix::builtin(),
    };
    info!(features = matrix.known_features().len(), "Permission matrix loaded");
    let routes = match &cfg.routes_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading route table {path}"))?;
            RouteTable::from_json_str(&raw)?
        }
        None => RouteTable::builtin(),
    };
    Ok(AccessDecisionEngine::new(routes, Arc::new(matrix))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("health") {
        run_health_check().await;
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tiergate=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env()?;
    let engine = load_engine(&cfg)?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/tiergate.db", cfg.data_dir);
    let db = tiergate_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;
    let store: Arc<dyn TierStore> = Arc::new(db);

    let (identity, billing) = providers_from_config(&cfg);
    if cfg.session_secret.is_none() {
        tracing::warn!("TIERGATE_SESSION_SECRET not set; every forward-auth caller is anonymous");
    }
    if cfg.admin_token.is_none() {
        tracing::warn!("TIERGATE_ADMIN_TOKEN not set; decision and cache endpoints are open");
    }

    let state = Arc::new(AppState::new(cfg.clone(), engine, store, identity, billing));
    let sweeper = state.cache().spawn_sweeper();

    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = tiergate_server::app::build_app(Arc::clone(&state));

    info!(
        port = cfg.port,
        fallback_tier = %cfg.fallback_tier,
        "Tiergate listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!(stats = ?state.cache().get_stats(), "Tiergate stopping");
    state.cache().shutdown();
    if let Some(sweeper) = sweeper {
        sweeper.await.ok();
    }

    Ok(())
}
