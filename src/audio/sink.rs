//! Seams between the playback engine and whatever actually moves audio.
//!
//! The engine never touches songbird directly: it opens sources through an
//! [`AudioSink`], controls them through a [`SourceHandle`] and joins or leaves
//! voice channels through a [`VoiceConnector`].

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::{ConnectionError, SinkError};

/// Identifies one playback attempt inside a guild worker.
pub type AttemptId = u64;

/// Message delivered to the guild worker when a source stops.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackCompletion {
    pub attempt: AttemptId,
    pub error: Option<SinkError>,
}

/// Fires exactly once per playback attempt.
///
/// Calling [`Completion::finish`] consumes it. If it is dropped unfired the
/// worker still hears about it, as a playback error.
pub struct Completion {
    attempt: AttemptId,
    tx: Option<mpsc::UnboundedSender<PlaybackCompletion>>,
}

impl Completion {
    pub fn new(attempt: AttemptId, tx: mpsc::UnboundedSender<PlaybackCompletion>) -> Self {
        Self {
            attempt,
            tx: Some(tx),
        }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn finish(mut self, error: Option<SinkError>) {
        self.send(error);
    }

    fn send(&mut self, error: Option<SinkError>) {
        if let Some(tx) = self.tx.take() {
            if tx
                .send(PlaybackCompletion {
                    attempt: self.attempt,
                    error,
                })
                .is_err()
            {
                debug!("El worker de la guild ya no existe, descartando finalización del intento {}", self.attempt);
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Some(SinkError::Playback(
            "source descartado antes de reportar su finalización".to_string(),
        )));
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("attempt", &self.attempt)
            .field("fired", &self.tx.is_none())
            .finish()
    }
}

/// Control over a source that is bound to a voice connection.
pub trait SourceHandle: Send + Sync {
    fn set_volume(&self, volume: f32) -> Result<(), SinkError>;
    fn pause(&self) -> Result<(), SinkError>;
    fn resume(&self) -> Result<(), SinkError>;
    /// Stops the source. The attempt's completion fires afterwards.
    fn stop(&self) -> Result<(), SinkError>;
}

/// Turns a stream locator into audio on the guild's live voice connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Opens `locator` and starts it at `volume`. On success the sink owns
    /// `completion` and must fire it when the source ends.
    async fn open(
        &self,
        guild_id: GuildId,
        locator: &str,
        volume: f32,
        completion: Completion,
    ) -> Result<Box<dyn SourceHandle>, SinkError>;
}

/// Voice channel membership for the bot, one attempt per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), ConnectionError>;

    /// Forcibly leaves the guild's voice channel.
    async fn disconnect(&self, guild_id: GuildId) -> Result<(), ConnectionError>;

    fn is_connected(&self, guild_id: GuildId) -> bool;
}
