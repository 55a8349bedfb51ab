use dashmap::DashMap;
use serenity::{
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::handlers::format_duration;
use crate::audio::engine::PlaybackNotice;

/// Remembers which text channel each guild last used, so engine notices
/// land where the conversation is.
#[derive(Debug, Default)]
pub struct NoticeChannels {
    channels: DashMap<GuildId, ChannelId>,
}

impl NoticeChannels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn remember(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.channels.insert(guild_id, channel_id);
    }

    pub fn channel_for(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.channels.get(&guild_id).map(|c| *c)
    }
}

/// Text posted for a notice. `None` for notices not worth a message.
pub fn render(notice: &PlaybackNotice) -> (GuildId, Option<String>) {
    match notice {
        PlaybackNotice::NowPlaying { guild_id, track } => {
            let length = track
                .duration()
                .map(|_| format!(" ({})", format_duration(track.duration_secs)))
                .unwrap_or_default();
            (
                *guild_id,
                Some(format!("🎵 Reproduciendo ahora: **{}**{}", track.title, length)),
            )
        }
        PlaybackNotice::QueueFinished { guild_id } => {
            (*guild_id, Some("📭 Cola terminada.".to_string()))
        }
        PlaybackNotice::RetriesExhausted { guild_id, track } => {
            let what = track
                .as_ref()
                .map(|t| format!("**{}**", t.title))
                .unwrap_or_else(|| "la canción actual".to_string());
            (
                *guild_id,
                Some(format!(
                    "❌ No se pudo reproducir {what} tras varios intentos, así que salí del canal de voz."
                )),
            )
        }
        // Stop y leave ya le responden al usuario directamente.
        PlaybackNotice::Disconnected { guild_id } => (*guild_id, None),
    }
}

/// Posts engine notices until the engine goes away.
pub async fn forward_notices(
    http: Arc<Http>,
    mut notices: broadcast::Receiver<PlaybackNotice>,
    channels: Arc<NoticeChannels>,
) {
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(RecvError::Lagged(skipped)) => {
                warn!("El reenvío de avisos se atrasó, se saltaron {} aviso(s)", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let (guild_id, Some(text)) = render(&notice) else {
            continue;
        };
        let Some(channel_id) = channels.channel_for(guild_id) else {
            debug!("Sin canal de texto conocido para guild {}, descartando aviso", guild_id);
            continue;
        };

        if let Err(e) = channel_id.say(&*http, text).await {
            warn!("No se pudo publicar el aviso en guild {}: {:?}", guild_id, e);
        }
    }
    debug!("Reenvío de avisos detenido");
}
