use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::engine::{PlaybackEngine, PlaybackState};

/// One member's voice presence, as far as idle detection cares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoicePresence {
    pub user_id: UserId,
    pub channel_id: Option<ChannelId>,
    pub is_bot: bool,
}

/// Humans sharing the bot's voice channel, or `None` if the bot is not in one.
/// Other bots don't count as listeners.
pub fn count_listeners(presences: &[VoicePresence], bot_id: UserId) -> Option<usize> {
    let channel_id = presences
        .iter()
        .find(|presence| presence.user_id == bot_id)?
        .channel_id?;

    let count = presences
        .iter()
        .filter(|p| p.channel_id == Some(channel_id) && p.user_id != bot_id && !p.is_bot)
        .count();
    Some(count)
}

/// Runs when the idle grace period ends. `listeners` is the membership
/// re-checked at that moment; only an empty channel makes the bot leave.
pub async fn leave_if_still_idle(
    engine: &PlaybackEngine,
    guild_id: GuildId,
    listeners: Option<usize>,
) -> bool {
    if listeners != Some(0) {
        debug!("La guild {} tiene oyentes de nuevo, se queda", guild_id);
        return false;
    }

    match engine.state(guild_id).await {
        Ok(PlaybackState::Disconnected) => return false,
        Ok(_) => {}
        Err(e) => {
            warn!("No se pudo leer el estado de la guild {}: {}", guild_id, e);
            return false;
        }
    }

    info!("💤 Saliendo del canal de voz inactivo en guild {}", guild_id);
    if let Err(e) = engine.leave(guild_id).await {
        error!("Error saliendo de la guild inactiva {}: {}", guild_id, e);
        return false;
    }
    true
}

/// Debounces "the bot is alone in its voice channel" per guild.
///
/// At most one check is pending per guild. Scheduling again replaces the
/// previous check, and [`IdleMonitor::cancel`] drops it.
pub struct IdleMonitor {
    timeout: Duration,
    pending: DashMap<GuildId, (u64, CancellationToken)>,
    generation: AtomicU64,
}

impl IdleMonitor {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Runs `on_expire` after the timeout unless cancelled first.
    pub fn schedule<F, Fut>(self: &Arc<Self>, guild_id: GuildId, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        if let Some((_, (_, previous))) = self.pending.remove(&guild_id) {
            previous.cancel();
        }
        self.pending.insert(guild_id, (generation, token.clone()));

        info!(
            "🚪 Solo en el canal de voz en guild {}, saliendo en {}",
            guild_id,
            humantime::format_duration(self.timeout)
        );

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Chequeo de inactividad cancelado para guild {}", guild_id);
                }
                _ = tokio::time::sleep(monitor.timeout) => {
                    monitor
                        .pending
                        .remove_if(&guild_id, |_, (current, _)| *current == generation);
                    on_expire().await;
                }
            }
        });
    }

    /// Someone came back; drop the pending check.
    pub fn cancel(&self, guild_id: GuildId) {
        if let Some((_, (_, token))) = self.pending.remove(&guild_id) {
            token.cancel();
            debug!("Hay oyentes en guild {}, chequeo de inactividad cancelado", guild_id);
        }
    }

    pub fn is_pending(&self, guild_id: GuildId) -> bool {
        self.pending.contains_key(&guild_id)
    }
}
