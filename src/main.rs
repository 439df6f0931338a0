use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use diagrambot::bot::sync::SyncSource;
use diagrambot::bot::{
    ChatClient, DiagramBot, DiagramExtractor, DiagramTracker, MatrixClient, MermaidCli,
    RenderDispatcher, RouterConfig, SvgCodec, SyncLoop, SyncSettings,
};
use diagrambot::config::{Config, Credentials};
use diagrambot::matrix_log::{LogForwarder, MatrixLogLayer};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "diagrambot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("diagrambot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    let forwarder = if let Some(ref log_room_id) = config.log_room_id {
        let (layer, forwarder) = MatrixLogLayer::new(log_room_id.clone());
        registry.with(layer).init();
        Some(forwarder)
    } else {
        registry.init();
        None
    };

    info!("🚀 Starting diagrambot...");
    info!("Loaded config from {config_path}");

    tokio::select! {
        result = run(config, forwarder) => {
            if let Err(e) = result {
                error!("Fatal: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Shutting down");
        }
    }
}

async fn run(mut config: Config, forwarder: Option<LogForwarder>) -> Result<(), String> {
    let access_token = match config.credentials.clone() {
        Credentials::AccessToken(token) => token,
        Credentials::Password { login_name, password } => {
            let token = MatrixClient::login(&config.homeserver_url, &login_name, &password).await?;
            match config.store_access_token(&token) {
                Ok(()) => info!("Saved access token to {}", config.config_path.display()),
                Err(e) => warn!("Could not save access token: {e}"),
            }
            token
        }
    };

    let client = Arc::new(MatrixClient::connect(&config.homeserver_url, &access_token).await?);
    if let Some(forwarder) = forwarder {
        forwarder.start(client.clone());
    }

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| format!("Failed to create {}: {e}", config.data_dir.display()))?;
    let tracker = Arc::new(DiagramTracker::open(&config.data_dir.join("diagrams.db"))?);
    info!("Tracking {} rendered diagram(s)", tracker.len()?);

    let renderer = Arc::new(MermaidCli::new(
        config.renderer_command.clone(),
        config.renderer_puppeteer_config.clone(),
    ));
    let codec = Arc::new(SvgCodec::with_system_fonts());
    let extractor = DiagramExtractor::new(&config.diagram_language)?;

    let chat: Arc<dyn ChatClient> = client.clone();
    let dispatcher = RenderDispatcher::new(extractor, chat.clone(), renderer, codec, tracker);
    let bot = DiagramBot::new(
        chat,
        dispatcher,
        RouterConfig {
            permission_action: config.manage_power_action.clone(),
            notice_in_thread: config.notices_in_thread,
        },
    )?;

    let mut settings = SyncSettings::new(&config.data_dir);
    settings.autojoin = config.autojoin;
    settings.record_retention = config.record_retention();
    settings.pending_ttl = config.pending_ttl();

    info!(
        "🎨 Rendering ```{} blocks as {}",
        config.diagram_language,
        client.user_id()
    );

    let source: Arc<dyn SyncSource> = client;
    SyncLoop::new(source, bot, settings).run().await;
    Ok(())
}
