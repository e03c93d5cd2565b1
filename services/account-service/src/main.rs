use account_service::{
    config::Config,
    handlers::{self, AppState},
    id::IdGenerator,
    metrics::{register_metrics, REGISTRY},
    middleware::build_stack,
    service::CoreService,
};
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use ledger_core::{AccountStore, Ledger, LedgerEngine, MemoryStore, PgStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Account Service...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let system_accounts = Arc::new(config.system_accounts()?);
    info!(currencies = system_accounts.len(), "Configuration loaded successfully");

    register_metrics(&REGISTRY).context("Failed to register metrics")?;

    // Account store
    let store: Arc<dyn AccountStore> = if config.database.url.starts_with("memory:") {
        info!("Using in-memory account store");
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::connect(&config.database)
            .await
            .context("Database connection failed")?;
        info!("Database health check passed");
        Arc::new(store)
    };
    let ledger: Arc<dyn LedgerEngine> = Arc::new(Ledger::new(store));

    if config.database.url.starts_with("memory:") {
        // Nothing is provisioned out of band for a throwaway store
        for (currency, id) in system_accounts.iter() {
            let email = format!("system-{}@ledger.local", currency.to_lowercase());
            ledger.create_account(&email, currency, id).await?;
        }
    }

    // Refuses to start on any system account misconfiguration
    let core = CoreService::new(
        ledger.clone(),
        system_accounts.clone(),
        IdGenerator::new(config.id.node_id)?,
    )
    .await?;

    let stack = build_stack(
        Arc::new(core),
        ledger,
        system_accounts,
        &config.limits,
        &config.breakers,
    )?;
    let state = AppState {
        service: stack.service,
        breakers: stack.breakers,
    };

    info!("Account components initialized successfully");

    let server_config = config.server.clone();

    info!(
        "Starting HTTP server on {}:{}",
        server_config.host, server_config.port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .configure(handlers::configure_routes)
    })
    .workers(server_config.workers)
    .bind((server_config.host, server_config.port))?
    .run()
    .await?;

    Ok(())
}
