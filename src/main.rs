use anyhow::Context;
use roomchat::{AppState, Config, Store, app};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("roomchat=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("could not open {}", config.database_url))?;
    info!("store ready at {}", config.database_url);

    let app = app(AppState::new(store.clone()), config.client_url.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
