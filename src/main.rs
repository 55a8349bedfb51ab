use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod config;
mod sources;

use crate::audio::{engine::PlaybackEngine, songbird_sink::SongbirdBackend};
use crate::bot::MusicBot;
use crate::config::Config;
use crate::sources::YtDlpResolver;

/// Upper bound on entries expanded from one playlist.
const MAX_PLAYLIST_ENTRIES: usize = 50;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_queue=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando voice-queue v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let resolver = Arc::new(YtDlpResolver::new(
        config.ytdlp_path.clone(),
        config.ytdlp_cookies.clone(),
        MAX_PLAYLIST_ENTRIES.min(config.max_queue_size),
    ));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&resolver).await;
    }

    match resolver.check_available().await {
        Ok(version) => info!("✅ yt-dlp {} disponible", version),
        Err(e) => warn!("⚠️ yt-dlp no responde, la reproducción no funcionará: {}", e),
    }

    let songbird = Songbird::serenity();
    let backend = Arc::new(SongbirdBackend::new(songbird.clone()));
    let engine = Arc::new(PlaybackEngine::new(
        resolver,
        backend.clone(),
        backend,
        config.engine_settings(),
    ));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let config = Arc::new(config);
    let handler = MusicBot::new(config.clone(), engine.clone());

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("No se pudo escuchar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, saliendo de los canales de voz...");
        engine.leave_all().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error del cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check(resolver: &YtDlpResolver) -> Result<()> {
    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    match resolver.check_available().await {
        Ok(_) if ffmpeg.status.success() => {
            println!("OK");
            Ok(())
        }
        Ok(_) => anyhow::bail!("Falta ffmpeg"),
        Err(e) => anyhow::bail!("Falta yt-dlp: {e}"),
    }
}
