use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{HttpRequest, Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    error::{ConnectionError, SinkError},
    sink::{AudioSink, Completion, SourceHandle, VoiceConnector},
};

const DIRECT_AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "opus", "flac", "wav", "m4a", "aac", "webm"];

/// Plays through songbird and manages the bot's voice connections.
#[derive(Clone)]
pub struct SongbirdBackend {
    songbird: Arc<Songbird>,
    http: reqwest::Client,
}

impl SongbirdBackend {
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self {
            songbird,
            http: reqwest::Client::new(),
        }
    }

    fn input_for(&self, locator: &str) -> Input {
        if is_direct_audio(locator) {
            debug!("Streaming {} por HTTP", locator);
            HttpRequest::new(self.http.clone(), locator.to_string()).into()
        } else {
            YoutubeDl::new(self.http.clone(), locator.to_string()).into()
        }
    }
}

/// Plain file URLs skip yt-dlp and stream directly.
fn is_direct_audio(locator: &str) -> bool {
    url::Url::parse(locator)
        .ok()
        .and_then(|url| {
            let path = url.path().to_ascii_lowercase();
            path.rsplit_once('.').map(|(_, ext)| ext.to_string())
        })
        .is_some_and(|ext| DIRECT_AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

#[async_trait]
impl AudioSink for SongbirdBackend {
    async fn open(
        &self,
        guild_id: GuildId,
        locator: &str,
        volume: f32,
        completion: Completion,
    ) -> Result<Box<dyn SourceHandle>, SinkError> {
        let call = self.songbird.get(guild_id).ok_or(SinkError::NoConnection)?;
        let input = self.input_for(locator);

        let handle = {
            let mut call = call.lock().await;
            if call.current_channel().is_none() {
                return Err(SinkError::NoConnection);
            }
            call.play_input(input)
        };

        if let Err(e) = handle.set_volume(volume) {
            let _ = handle.stop();
            return Err(SinkError::Open(e.to_string()));
        }

        let attempt = completion.attempt();
        // End y Error pueden dispararse para el mismo track; reporta el primero.
        let notifier = TrackEndNotifier {
            guild_id,
            completion: Arc::new(Mutex::new(Some(completion))),
        };
        for event in [TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = handle.add_event(Event::Track(event), notifier.clone()) {
                let _ = handle.stop();
                return Err(SinkError::Open(format!("no se pudo observar el track: {e}")));
            }
        }

        debug!("Source abierto en guild {} (intento {}): {}", guild_id, attempt, locator);
        Ok(Box::new(SongbirdTrack { handle }))
    }
}

#[async_trait]
impl VoiceConnector for SongbirdBackend {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), ConnectionError> {
        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);
        self.songbird
            .join(guild_id, channel_id)
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::new(1, e.to_string()))
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), ConnectionError> {
        if self.songbird.get(guild_id).is_none() {
            return Ok(());
        }

        // remove() también descarta el Call, así el siguiente join empieza limpio.
        self.songbird
            .remove(guild_id)
            .await
            .map_err(|e| ConnectionError::new(1, e.to_string()))?;
        info!("👋 Desconectado del canal de voz en guild {}", guild_id);
        Ok(())
    }

    fn is_connected(&self, guild_id: GuildId) -> bool {
        match self.songbird.get(guild_id) {
            Some(call) => call
                .try_lock()
                .map(|call| call.current_channel().is_some())
                .unwrap_or(true),
            None => false,
        }
    }
}

struct SongbirdTrack {
    handle: TrackHandle,
}

impl SourceHandle for SongbirdTrack {
    fn set_volume(&self, volume: f32) -> Result<(), SinkError> {
        self.handle
            .set_volume(volume)
            .map_err(|e| SinkError::Control(e.to_string()))
    }

    fn pause(&self) -> Result<(), SinkError> {
        self.handle
            .pause()
            .map_err(|e| SinkError::Control(e.to_string()))
    }

    fn resume(&self) -> Result<(), SinkError> {
        self.handle
            .play()
            .map_err(|e| SinkError::Control(e.to_string()))
    }

    fn stop(&self) -> Result<(), SinkError> {
        self.handle
            .stop()
            .map_err(|e| SinkError::Control(e.to_string()))
    }
}

#[derive(Clone)]
struct TrackEndNotifier {
    guild_id: GuildId,
    completion: Arc<Mutex<Option<Completion>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(SinkError::Playback(format!("{e:?}"))),
                _ => None,
            }),
            _ => None,
        };

        if let Some(completion) = self.completion.lock().take() {
            match &error {
                Some(e) => warn!("Track fallido en guild {}: {}", self.guild_id, e),
                None => debug!("Track terminado en guild {}", self.guild_id),
            }
            completion.finish(error);
        }

        Some(Event::Cancel)
    }
}
