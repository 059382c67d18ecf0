use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_hub::coordinator::{self, Coordinator};
use irrigation_hub::db::Db;
use irrigation_hub::state::SystemState;
use irrigation_hub::{config, web};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    let site = cfg.site_id();
    let offset = cfg.site_offset()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?.with_retry(cfg.retry_policy());
    db.migrate().await.context("failed to migrate database")?;
    let db = Arc::new(db);

    // Seed the schedule (merge only; never clears stored periods).
    config::apply(&cfg, db.as_ref(), &site).await?;

    info!(site = %site, %offset, db = %db_url, "db ready");

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(site.clone())));
    shared.write().await.record_system("hub started".to_string());

    // ── Coordinator ─────────────────────────────────────────────────
    let engine = Coordinator::new(site.clone(), Arc::clone(&db), Arc::clone(&shared), offset);
    let (handle, engine_task) = coordinator::spawn(engine, cfg.tick_interval());

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        site,
        offset,
        shared,
        coordinator: handle,
        db,
    };

    tokio::select! {
        res = web::serve(app, web_port) => res,
        res = engine_task => {
            warn!("coordinator task ended");
            res.context("coordinator task failed")
        }
    }
}
