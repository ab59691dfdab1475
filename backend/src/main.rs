use backend::{app, AppState, Config};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };
    let state = match AppState::from_config(&config).await {
        Ok(state) => state,
        Err(err) => {
            error!(%err, "failed to start");
            std::process::exit(1);
        }
    };

    info!(addr = %config.bind_addr, "starting server");
    axum::serve(
        tokio::net::TcpListener::bind(&config.bind_addr)
            .await
            .expect("bind"),
        app(state),
    )
    .await
    .expect("server error");
}
