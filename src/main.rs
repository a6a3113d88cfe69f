use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use babelchat::config::Config;
use babelchat::crypto::MessageCipher;
use babelchat::pipeline::MessagePipeline;
use babelchat::rooms::RoomRegistry;
use babelchat::routes;
use babelchat::store::PgStore;
use babelchat::translation::TranslationClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("babelchat=info".parse()?),
        )
        .init();

    info!("Starting babelchat server");

    // Load configuration from environment
    let config = Config::from_env()?;

    // The key is validated at startup no matter what: a missing or
    // malformed ENCRYPTION_KEY is fatal, never a per-request error.
    // Whether new messages are actually sealed is a separate policy knob.
    let cipher = MessageCipher::from_hex_key(&config.encryption_key)?;
    let cipher = if config.encrypt_messages {
        info!("Message-at-rest encryption enabled");
        Some(cipher)
    } else {
        info!("Message-at-rest encryption disabled (ENCRYPT_MESSAGES not set)");
        None
    };

    let store = PgStore::connect(&config.database_url).await?;
    store.init_schema().await?;
    info!("Connected to database");

    let translator = TranslationClient::from_config(&config)?;

    let pipeline = Arc::new(MessagePipeline::new(
        store.clone(),
        store,
        translator,
        cipher,
        RoomRegistry::new(),
        config.max_message_chars,
    ));

    let app = routes::router(pipeline);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Listening on port {}", config.port);
    axum::serve(listener, app).await?;

    Ok(())
}
