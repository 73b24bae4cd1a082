use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forage_api::{router, sources::NoopSource, AppState};
use forage_common::Config;
use forage_store::{DocumentStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("forage=info".parse()?))
        .init();

    let config = Config::from_env()?;
    config.log_redacted();

    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            info!("Connected to Postgres, migrations applied");
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let addr = format!("{}:{}", config.web_host, config.web_port);
    let (state, _learner) = AppState::new(config, store, Arc::new(NoopSource));
    state.budget.log_status().await?;
    let app = router(Arc::new(state));

    info!("Forage API starting on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
