//! # Bot Module
//!
//! Discord glue around the playback engine.
//!
//! - [`commands`]: the command table and slash-command definitions
//! - [`handlers`]: one handler per command, answering in plain text
//! - [`idle`]: leaves a voice channel after everyone else has gone
//! - [`notices`]: posts engine notices (now playing, failures) to chat
//!
//! [`MusicBot`] implements Serenity's [`EventHandler`] and owns the shared
//! [`PlaybackEngine`].

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info, warn};

pub mod commands;
pub mod handlers;
pub mod idle;
pub mod notices;

use self::{
    commands::CommandTable,
    idle::{IdleMonitor, VoicePresence},
    notices::NoticeChannels,
};
use crate::{audio::engine::PlaybackEngine, config::Config};

pub struct MusicBot {
    config: Arc<Config>,
    pub engine: Arc<PlaybackEngine>,
    pub commands: CommandTable,
    pub notices: Arc<NoticeChannels>,
    pub idle: Arc<IdleMonitor>,
    // ready se dispara de nuevo tras cada reconexión del gateway
    forwarder_started: AtomicBool,
}

impl MusicBot {
    pub fn new(config: Arc<Config>, engine: Arc<PlaybackEngine>) -> Self {
        let idle = IdleMonitor::new(config.idle_timeout);
        Self {
            config,
            engine,
            commands: CommandTable::new(),
            notices: NoticeChannels::new(),
            idle,
            forwarder_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands globally, or on `GUILD_ID` when set.
    ///
    /// Guild commands show up almost immediately; global ones can take up to an hour.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando {} comandos slash...", self.commands.len());

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id, &self.commands).await?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx, &self.commands).await?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Humans in the bot's voice channel, or `None` if the bot is not in one.
    fn listeners(ctx: &Context, guild_id: GuildId) -> Option<usize> {
        let bot_id = ctx.cache.current_user().id;
        let presences: Vec<VoicePresence> = {
            let guild = guild_id.to_guild_cached(&ctx.cache)?;
            guild
                .voice_states
                .values()
                .map(|state| VoicePresence {
                    user_id: state.user_id,
                    channel_id: state.channel_id,
                    is_bot: state.user_id == bot_id
                        || state.member.as_ref().is_some_and(|m| m.user.bot),
                })
                .collect()
        };
        idle::count_listeners(&presences, bot_id)
    }

    fn check_idle(&self, ctx: &Context, guild_id: GuildId) {
        match Self::listeners(ctx, guild_id) {
            Some(0) => {
                if self.idle.is_pending(guild_id) {
                    return;
                }
                let ctx = ctx.clone();
                let engine = self.engine.clone();
                self.idle.schedule(guild_id, move || async move {
                    // Alguien pudo volver sin que viéramos el evento.
                    let listeners = Self::listeners(&ctx, guild_id);
                    idle::leave_if_still_idle(&engine, guild_id, listeners).await;
                });
            }
            _ => self.idle.cancel(guild_id),
        }
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error registrando comandos: {:?}", e);
        }

        if !self.forwarder_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(notices::forward_notices(
                ctx.http.clone(),
                self.engine.subscribe(),
                self.notices.clone(),
            ));
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Tracks the bot being kicked from voice and channels emptying out.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let bot_id = ctx.cache.current_user().id;
        if new.user_id == bot_id && new.channel_id.is_none() {
            if old.is_some() {
                info!("🔌 Bot desconectado en guild {}", guild_id);
            }
            self.idle.cancel(guild_id);
            self.engine.handle_disconnected(guild_id);
            return;
        }

        self.check_idle(&ctx, guild_id);
    }
}
