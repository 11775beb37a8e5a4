use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use gradewatch::config::Settings;
use gradewatch::engine::Engine;
use gradewatch::events::Notifier;
use gradewatch::models::PortalKind;
use gradewatch::portal::Portals;
use gradewatch::scheduler::Scheduler;
use gradewatch::store::{MemoryStore, PgStore, Store};
use gradewatch::vault::Vault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().skip(1).any(|arg| arg == "--gen-key") {
        println!("{}", Vault::generate_key());
        return Ok(());
    }

    env_logger::init();
    let settings = Settings::from_env()?;
    let vault = Arc::new(Vault::from_key_material(&settings.vault_key).context("Could not load VAULT_KEY")?);

    let store: Arc<dyn Store> = match &settings.database_url {
        Some(url) => {
            let pg = PgStore::connect(url)
                .await
                .context("Could not connect to DATABASE_URL")?;
            pg.migrate().await.context("Could not prepare database schema")?;
            log::info!("Using PostgreSQL store");
            Arc::new(pg)
        }
        None => {
            log::warn!("DATABASE_URL is not set, state lives in memory and is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let (notifier, mut notifications) = Notifier::channel();
    let engine = Arc::new(Engine::new(
        store,
        vault,
        Portals::live(),
        notifier,
        settings.clone(),
    ));

    let drain = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match serde_json::to_string(&notification) {
                Ok(json) => log::info!("Notification: {}", json),
                Err(err) => log::error!("Could not serialize notification: {}", err),
            }
        }
    });

    let (stop, stopped) = watch::channel(false);
    let schedulers: Vec<_> = PortalKind::ALL
        .iter()
        .map(|kind| {
            let scheduler = Scheduler::new(engine.clone(), *kind, settings.check_interval(*kind));
            tokio::spawn(scheduler.run(stopped.clone()))
        })
        .collect();

    let app = gradewatch::router(engine.clone());
    log::info!("Starting gradewatch control API on http://{}", settings.bind_addr);
    axum::Server::bind(&settings.bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("Could not listen for shutdown signal: {}", err);
            }
        })
        .await?;

    log::info!("Shutting down, waiting for running checks");
    stop.send(true)?;
    for scheduler in schedulers {
        scheduler.await?;
    }
    drop(engine);
    drain.await?;
    Ok(())
}
