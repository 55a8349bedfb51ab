use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
        permissions::Permissions,
    },
    prelude::Context,
};
use tracing::{info, warn};

use super::{commands::MusicCommand, MusicBot};
use crate::audio::{
    engine::{EnqueueOutcome, GuildStatus, PlaybackState},
    error::{PlaybackError, PlaybackResult, ResolutionError},
    queue::{LoopMode, Track},
};

const LIST_LIMIT: usize = 10;

/// A plain-text answer to a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub content: String,
    pub ephemeral: bool,
}

impl Reply {
    pub fn public(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: false,
        }
    }

    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: true,
        }
    }
}

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &MusicBot) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return respond(ctx, &command, Reply::ephemeral("❌ Los comandos solo funcionan dentro de un servidor")).await;
    };

    info!(
        "📝 /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );
    bot.notices.remember(guild_id, command.channel_id);

    let Some(kind) = bot.commands.lookup(&command.data.name) else {
        warn!("Comando desconocido /{}", command.data.name);
        return respond(ctx, &command, Reply::ephemeral("❌ Comando no reconocido")).await;
    };

    if kind == MusicCommand::Play {
        return handle_play(ctx, &command, bot, guild_id).await;
    }

    let reply = match run(&command, bot, guild_id, kind).await {
        Ok(reply) => reply,
        Err(e) => Reply::ephemeral(describe_error(&e)),
    };
    respond(ctx, &command, reply).await
}

async fn respond(ctx: &Context, command: &CommandInteraction, reply: Reply) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(reply.content)
                    .ephemeral(reply.ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &MusicBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(query) = option_str(command, "query").map(str::to_string) else {
        return respond(ctx, command, Reply::ephemeral("❌ Dime qué reproducir")).await;
    };

    let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, Reply::ephemeral("❌ Debes estar en un canal de voz")).await;
    };

    if let Some(problem) = bot_voice_permissions(ctx, guild_id, channel_id).and_then(voice_permission_problem) {
        warn!("Faltan permisos de voz en el canal {} de la guild {}", channel_id, guild_id);
        return respond(ctx, command, Reply::ephemeral(problem)).await;
    }

    // Defer la respuesta ya que buscar puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let content = match play(bot, guild_id, channel_id, &query, command.user.id).await {
        Ok(outcome) => format_enqueue(&outcome),
        Err(e) => describe_error(&e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;

    Ok(())
}

async fn play(
    bot: &MusicBot,
    guild_id: GuildId,
    channel_id: ChannelId,
    query: &str,
    requester: UserId,
) -> PlaybackResult<EnqueueOutcome> {
    bot.engine.join(guild_id, channel_id).await?;
    bot.engine.enqueue(guild_id, query, requester).await
}

async fn run(
    command: &CommandInteraction,
    bot: &MusicBot,
    guild_id: GuildId,
    kind: MusicCommand,
) -> PlaybackResult<Reply> {
    let engine = &bot.engine;

    let reply = match kind {
        MusicCommand::Pause => {
            engine.pause(guild_id).await?;
            Reply::public("⏸️ Reproducción pausada")
        }
        MusicCommand::Resume => {
            engine.resume(guild_id).await?;
            Reply::public("▶️ Reproducción reanudada")
        }
        MusicCommand::Skip => {
            let skipped = engine.skip(guild_id).await?;
            Reply::public(format!("⏭️ Saltada **{}**", skipped.title))
        }
        MusicCommand::Stop => {
            engine.stop(guild_id).await?;
            bot.idle.cancel(guild_id);
            Reply::public("⏹️ Reproducción detenida y cola limpiada")
        }
        MusicCommand::Queue => {
            let page = option_int(command, "page").unwrap_or(1).max(1) as usize;
            Reply::public(format_queue(&engine.snapshot(guild_id).await?, page))
        }
        MusicCommand::History => Reply::public(format_history(&engine.list_history(guild_id).await?)),
        MusicCommand::NowPlaying => {
            let status = engine.snapshot(guild_id).await?;
            match format_now_playing(&status) {
                Some(text) => Reply::public(text),
                None => Reply::ephemeral(describe_error(&PlaybackError::NothingPlaying)),
            }
        }
        MusicCommand::Volume => match option_int(command, "level") {
            Some(level) => {
                let percent = level.clamp(0, i64::from(u8::MAX)) as u8;
                engine.set_volume(guild_id, percent).await?;
                Reply::public(format!("🔊 Volumen ajustado a {percent}%"))
            }
            None => {
                let status = engine.snapshot(guild_id).await?;
                Reply::public(format!(
                    "🔊 Volumen: {}%",
                    (status.queue.volume * 100.0).round() as u32
                ))
            }
        },
        MusicCommand::Loop => {
            let raw = option_str(command, "mode").unwrap_or("off");
            match raw.parse::<LoopMode>() {
                Ok(mode) => {
                    engine.set_loop_mode(guild_id, mode).await?;
                    Reply::public(loop_message(mode))
                }
                Err(e) => Reply::ephemeral(format!("❌ {e}")),
            }
        }
        MusicCommand::Shuffle => {
            engine.shuffle(guild_id).await?;
            Reply::public("🔀 Cola mezclada")
        }
        MusicCommand::Remove => {
            let position = option_position(command, "position");
            let removed = engine.remove_at(guild_id, position).await?;
            Reply::public(format!("🗑️ Removida **{}**", removed.title))
        }
        MusicCommand::Move => {
            let from = option_position(command, "from");
            let to = option_position(command, "to");
            let moved = engine.move_to(guild_id, from, to).await?;
            Reply::public(format!("📍 **{}** movida a la posición {}", moved.title, to))
        }
        MusicCommand::Clear => {
            let cleared = engine.clear(guild_id).await?;
            Reply::public(format!("🗑️ {cleared} canción(es) eliminadas de la cola"))
        }
        MusicCommand::Leave => {
            engine.leave(guild_id).await?;
            bot.idle.cancel(guild_id);
            Reply::public("👋 Desconectado del canal de voz")
        }
        MusicCommand::Play => Reply::ephemeral("❌ Comando no reconocido"),
    };

    Ok(reply)
}

// Utilidades

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn option_int(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

/// 1-based position option; anything unusable becomes 0 and is rejected by the engine.
fn option_position(command: &CommandInteraction, name: &str) -> usize {
    option_int(command, name)
        .and_then(|value| usize::try_from(value).ok())
        .unwrap_or(0)
}

fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

/// The bot's permissions in `channel_id`, or `None` when the cache can't tell
/// (then joining is simply attempted).
fn bot_voice_permissions(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> Option<Permissions> {
    let bot_id = ctx.cache.current_user().id;
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    let channel = guild.channels.get(&channel_id)?;
    let member = guild.members.get(&bot_id)?;
    Some(guild.user_permissions_in(channel, member))
}

/// Why the bot can't play in a channel with `granted` permissions, if it can't.
fn voice_permission_problem(granted: Permissions) -> Option<String> {
    if !granted.contains(Permissions::CONNECT) {
        Some("❌ No tengo permiso para entrar a tu canal de voz".to_string())
    } else if !granted.contains(Permissions::SPEAK) {
        Some("❌ No tengo permiso para hablar en tu canal de voz".to_string())
    } else {
        None
    }
}

pub fn describe_error(error: &PlaybackError) -> String {
    match error {
        PlaybackError::Resolution(ResolutionError::NoResults(query)) => {
            format!("❌ No se encontraron resultados para `{query}`")
        }
        PlaybackError::Resolution(e) => format!("❌ No se pudo cargar: {e}"),
        PlaybackError::Connection(e) => format!(
            "❌ No se pudo conectar al canal de voz tras {} intento(s)",
            e.attempts
        ),
        PlaybackError::InvalidIndex { position, len } => {
            format!("❌ No hay canción en la posición {position} (la cola tiene {len})")
        }
        PlaybackError::InvalidVolume(_) => "❌ El volumen debe estar entre 0 y 100".to_string(),
        PlaybackError::NotConnected => "❌ No estoy en un canal de voz".to_string(),
        PlaybackError::NothingPlaying => "❌ No hay nada reproduciéndose actualmente".to_string(),
        PlaybackError::Sink(e) => format!("❌ Error de reproducción: {e}"),
        PlaybackError::WorkerUnavailable => "❌ Algo salió mal, intenta de nuevo".to_string(),
    }
}

fn loop_message(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "➡️ Repetición desactivada",
        LoopMode::Single => "🔂 Repitiendo la canción actual",
        LoopMode::Queue => "🔁 Repitiendo toda la cola",
    }
}

/// `m:ss`, or `h:mm:ss` past an hour. `0` means unknown.
pub fn format_duration(secs: u64) -> String {
    if secs == 0 {
        return "?:??".to_string();
    }
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn track_line(position: usize, track: &Track) -> String {
    format!(
        "`{}.` **{}** ({})",
        position,
        track.title,
        format_duration(track.duration_secs)
    )
}

pub fn format_enqueue(outcome: &EnqueueOutcome) -> String {
    let mut text = match (outcome.added.as_slice(), outcome.started) {
        ([track], true) => format!("▶️ Reproduciendo **{}**", track.title),
        ([track], false) => format!(
            "➕ **{}** agregada a la cola (posición {})",
            track.title,
            outcome.position.unwrap_or(1)
        ),
        ([first, ..], true) => format!(
            "➕ {} canciones agregadas, reproduciendo **{}**",
            outcome.added.len(),
            first.title
        ),
        (tracks, _) => format!("➕ {} canciones agregadas a la cola", tracks.len()),
    };

    if outcome.evicted > 0 {
        text.push_str(&format!(
            "\n⚠️ La cola estaba llena, se descartaron {} canción(es) antiguas",
            outcome.evicted
        ));
    }
    text
}

pub fn format_queue(status: &GuildStatus, page: usize) -> String {
    let snapshot = &status.queue;
    let mut lines = Vec::new();

    match &snapshot.now_playing {
        Some(track) => lines.push(format!(
            "🎵 Reproduciendo ahora: **{}**{}",
            track.title,
            status_suffix(status)
        )),
        None => lines.push("🎵 Nada reproduciéndose".to_string()),
    }

    if snapshot.pending.is_empty() {
        lines.push("📭 La cola está vacía".to_string());
    } else {
        let page = snapshot.page(page, LIST_LIMIT);
        lines.push(String::new());
        for (offset, track) in page.items.iter().enumerate() {
            lines.push(track_line(page.first_position + offset, track));
        }
        let shown_through = page.first_position - 1 + page.items.len();
        if page.total_items > shown_through {
            lines.push(format!("...y {} más", page.total_items - shown_through));
        }
        lines.push(format!(
            "\nPágina {}/{} · {} canción(es) · {} en total · loop: {}",
            page.current_page,
            page.total_pages,
            page.total_items,
            format_duration(snapshot.total_duration.as_secs()),
            snapshot.loop_mode
        ));
    }

    lines.join("\n")
}

/// Most recent first.
pub fn format_history(history: &[Track]) -> String {
    if history.is_empty() {
        return "📜 Todavía no se ha reproducido nada".to_string();
    }

    let mut lines = vec!["📜 Reproducidas recientemente:".to_string()];
    for (index, track) in history.iter().rev().take(LIST_LIMIT).enumerate() {
        lines.push(track_line(index + 1, track));
    }
    if history.len() > LIST_LIMIT {
        lines.push(format!("...y {} más", history.len() - LIST_LIMIT));
    }
    lines.join("\n")
}

fn status_suffix(status: &GuildStatus) -> String {
    if status.state == PlaybackState::Awaiting && status.retry_count > 0 {
        format!(" (reintentando, intento {})", status.retry_count + 1)
    } else if status.paused {
        " (pausada)".to_string()
    } else {
        String::new()
    }
}

fn format_now_playing(status: &GuildStatus) -> Option<String> {
    let track = status.queue.now_playing.as_ref()?;
    Some(format!(
        "🎵 **{}** ({}){}\nPedida por <@{}> · volumen {}% · loop: {}",
        track.title,
        format_duration(track.duration_secs),
        status_suffix(status),
        track.requested_by,
        (status.queue.volume * 100.0).round() as u32,
        status.queue.loop_mode
    ))
}
