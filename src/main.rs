use std::net::SocketAddr;
use std::time::Duration;

use storefront_webhooks::{
    config::{get_config, init_config},
    database::pool::create_pool,
    middleware::cors::storefront_cors,
    routes,
    services::outbox_sweeper::OutboxSweeper,
    AppState,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    init_config()?;
    let config = get_config();

    let pool = create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let app_state = AppState::new(pool, config.dispatcher_settings())?;

    {
        let sweeper = OutboxSweeper::new(app_state.dispatcher.clone());
        let interval = Duration::from_secs(config.webhook_outbox_sweep_secs.max(1));
        tokio::spawn(async move {
            loop {
                match sweeper.run_once().await {
                    Ok(resumed) if !resumed.is_empty() => {
                        info!(count = resumed.len(), "Resumed interrupted webhook deliveries");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = ?e, "Webhook outbox sweep error");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    let app = routes::router(app_state, &config.jwt_secret, config.public_rps)
        .layer(storefront_cors())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
