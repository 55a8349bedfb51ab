use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};
use std::collections::HashMap;

/// Every slash command the bot understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MusicCommand {
    Play,
    Pause,
    Resume,
    Skip,
    Stop,
    Queue,
    History,
    NowPlaying,
    Volume,
    Loop,
    Shuffle,
    Remove,
    Move,
    Clear,
    Leave,
}

impl MusicCommand {
    pub const ALL: [MusicCommand; 15] = [
        MusicCommand::Play,
        MusicCommand::Pause,
        MusicCommand::Resume,
        MusicCommand::Skip,
        MusicCommand::Stop,
        MusicCommand::Queue,
        MusicCommand::History,
        MusicCommand::NowPlaying,
        MusicCommand::Volume,
        MusicCommand::Loop,
        MusicCommand::Shuffle,
        MusicCommand::Remove,
        MusicCommand::Move,
        MusicCommand::Clear,
        MusicCommand::Leave,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MusicCommand::Play => "play",
            MusicCommand::Pause => "pause",
            MusicCommand::Resume => "resume",
            MusicCommand::Skip => "skip",
            MusicCommand::Stop => "stop",
            MusicCommand::Queue => "queue",
            MusicCommand::History => "history",
            MusicCommand::NowPlaying => "nowplaying",
            MusicCommand::Volume => "volume",
            MusicCommand::Loop => "loop",
            MusicCommand::Shuffle => "shuffle",
            MusicCommand::Remove => "remove",
            MusicCommand::Move => "move",
            MusicCommand::Clear => "clear",
            MusicCommand::Leave => "leave",
        }
    }

    /// The slash-command definition registered with Discord.
    pub fn definition(self) -> CreateCommand {
        let command = CreateCommand::new(self.name());
        match self {
            MusicCommand::Play => command
                .description("Reproduce una canción o playlist, o la agrega a la cola")
                .add_option(
                    CreateCommandOption::new(
                        CommandOptionType::String,
                        "query",
                        "URL o término de búsqueda",
                    )
                    .required(true),
                ),
            MusicCommand::Pause => command.description("Pausa la canción actual"),
            MusicCommand::Resume => command.description("Reanuda la canción pausada"),
            MusicCommand::Skip => command.description("Salta a la siguiente canción"),
            MusicCommand::Stop => {
                command.description("Detiene la reproducción, limpia la cola y sale del canal")
            }
            MusicCommand::Queue => command.description("Muestra la cola").add_option(
                CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página")
                    .min_int_value(1),
            ),
            MusicCommand::History => command.description("Muestra las canciones reproducidas recientemente"),
            MusicCommand::NowPlaying => command.description("Muestra la canción actual"),
            MusicCommand::Volume => command.description("Muestra o cambia el volumen").add_option(
                CreateCommandOption::new(CommandOptionType::Integer, "level", "Volumen (0-100)")
                    .min_int_value(0)
                    .max_int_value(100),
            ),
            MusicCommand::Loop => command.description("Cambia el modo de repetición").add_option(
                CreateCommandOption::new(CommandOptionType::String, "mode", "Modo de repetición")
                    .required(true)
                    .add_string_choice("Desactivado", "off")
                    .add_string_choice("Canción actual", "single")
                    .add_string_choice("Toda la cola", "queue"),
            ),
            MusicCommand::Shuffle => command.description("Mezcla la cola"),
            MusicCommand::Remove => command.description("Quita una canción de la cola").add_option(
                CreateCommandOption::new(CommandOptionType::Integer, "position", "Posición en la cola")
                    .required(true)
                    .min_int_value(1),
            ),
            MusicCommand::Move => command
                .description("Mueve una canción a otra posición de la cola")
                .add_option(
                    CreateCommandOption::new(CommandOptionType::Integer, "from", "Posición actual")
                        .required(true)
                        .min_int_value(1),
                )
                .add_option(
                    CreateCommandOption::new(CommandOptionType::Integer, "to", "Nueva posición")
                        .required(true)
                        .min_int_value(1),
                ),
            MusicCommand::Clear => command.description("Limpia la cola"),
            MusicCommand::Leave => command.description("Sale del canal de voz"),
        }
    }
}

/// Name to command lookup, built once at startup.
#[derive(Debug, Clone)]
pub struct CommandTable {
    by_name: HashMap<&'static str, MusicCommand>,
}

impl CommandTable {
    pub fn new() -> Self {
        let by_name = MusicCommand::ALL
            .iter()
            .map(|command| (command.name(), *command))
            .collect();
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Option<MusicCommand> {
        self.by_name.get(name).copied()
    }

    pub fn definitions(&self) -> Vec<CreateCommand> {
        MusicCommand::ALL.iter().map(|c| c.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Registra los comandos globalmente
pub async fn register_global_commands(ctx: &Context, table: &CommandTable) -> Result<()> {
    for command in table.definitions() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra los comandos en una sola guild (desarrollo)
pub async fn register_guild_commands(
    ctx: &Context,
    guild_id: GuildId,
    table: &CommandTable,
) -> Result<()> {
    guild_id.set_commands(&ctx.http, table.definitions()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_resolves_by_name() {
        let table = CommandTable::new();
        assert_eq!(table.len(), MusicCommand::ALL.len());
        for command in MusicCommand::ALL {
            assert_eq!(table.lookup(command.name()), Some(command));
        }
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let table = CommandTable::new();
        assert_eq!(table.lookup("lyrics"), None);
        assert_eq!(table.lookup("Play"), None);
        assert_eq!(table.lookup(""), None);
    }
}
