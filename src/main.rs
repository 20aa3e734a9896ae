use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

use review_balancer::admin::admin_router;
use review_balancer::ado::AdoClient;
use review_balancer::balancer::{balance_loop, reconcile_loop};
use review_balancer::triggers::{ChatTrigger, ReviewerTrigger};
use review_balancer::{AppState, Config, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting review balancer");

    let config =
        Config::from_env().context("failed to load configuration from environment variables")?;

    let db_path = config.state_dir.join("review-balancer.db");
    info!("Using state database: {}", db_path.display());
    let store = Store::new(&db_path).context("failed to initialize SQLite database")?;

    let ado_client = Arc::new(AdoClient::new(
        config.organization_url.clone(),
        &config.pat_token,
    ));

    let triggers = build_triggers(&config);

    let app_state = Arc::new(AppState::new(
        ado_client.clone(),
        ado_client,
        store,
        triggers,
        config.clone(),
    ));

    // Background loops: the fast balance pass and the slow reconcile pass.
    tokio::spawn(balance_loop(app_state.clone()));
    tokio::spawn(reconcile_loop(app_state.clone()));

    let app = admin_router(app_state.clone())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .context("failed to bind admin listener")?;
    info!("Admin server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_triggers(config: &Config) -> Vec<Arc<dyn ReviewerTrigger>> {
    let (Some(webhook_url), Some(channel)) = (&config.chat_webhook_url, &config.chat_channel)
    else {
        return Vec::new();
    };

    let trigger = ChatTrigger::new(webhook_url.clone(), channel.clone());
    let trigger = match &config.chat_alias_map_path {
        Some(path) => match trigger.with_alias_map_file(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to load chat alias map; using aliases as-is");
                ChatTrigger::new(webhook_url.clone(), channel.clone())
            }
        },
        None => trigger,
    };

    info!(channel = %channel, "chat reviewer trigger enabled");
    vec![Arc::new(trigger)]
}
