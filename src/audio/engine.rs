use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{
    error::{ConnectionError, PlaybackError, PlaybackResult, ResolutionError, SinkError},
    queue::{GuildQueue, LoopMode, QueueLimits, QueueSnapshot, Track},
    retry::{RetryDecision, RetryPolicy},
    sink::{AttemptId, AudioSink, Completion, PlaybackCompletion, SourceHandle, VoiceConnector},
};
use crate::sources::TrackResolver;

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_VOLUME: f32 = 0.5;

/// Tunables shared by every guild worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub limits: QueueLimits,
    pub default_volume: f32,
    pub retry: RetryPolicy,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            limits: QueueLimits::default(),
            default_volume: DEFAULT_VOLUME,
            retry: RetryPolicy::default(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Connected, nothing bound, nothing to play.
    Idle,
    /// Choosing the next track or (re)opening a source, including retry backoff.
    Awaiting,
    /// A source is bound to the voice connection.
    Playing,
    /// No voice connection.
    Disconnected,
}

/// Things the command layer may want to tell users about unprompted.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    NowPlaying { guild_id: GuildId, track: Track },
    QueueFinished { guild_id: GuildId },
    RetriesExhausted { guild_id: GuildId, track: Option<Track> },
    Disconnected { guild_id: GuildId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub added: Vec<Track>,
    /// Oldest pending tracks dropped to stay within capacity.
    pub evicted: usize,
    /// 1-based queue position of the first added track, `None` if it started right away.
    pub position: Option<usize>,
    pub started: bool,
}

/// Everything about one guild in a single consistent read.
#[derive(Debug, Clone)]
pub struct GuildStatus {
    pub queue: QueueSnapshot,
    pub state: PlaybackState,
    pub paused: bool,
    pub retry_count: u32,
}

type Inspect = Box<dyn FnOnce(&mut GuildWorker) + Send>;

enum GuildCommand {
    Join {
        channel_id: ChannelId,
        reply: oneshot::Sender<PlaybackResult<()>>,
    },
    Enqueue {
        tracks: Vec<Track>,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    #[cfg(test)]
    Advance {
        reply: oneshot::Sender<PlaybackState>,
    },
    Skip {
        reply: oneshot::Sender<PlaybackResult<Track>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Disconnected,
    RetryDue {
        id: AttemptId,
    },
    With(Inspect),
}

#[derive(Clone)]
struct GuildHandle {
    tx: mpsc::UnboundedSender<GuildCommand>,
}

/// Owns every guild's playback. One serialized worker task per guild,
/// created on first use.
pub struct PlaybackEngine {
    resolver: Arc<dyn TrackResolver>,
    sink: Arc<dyn AudioSink>,
    connector: Arc<dyn VoiceConnector>,
    settings: EngineSettings,
    workers: DashMap<GuildId, GuildHandle>,
    notices: broadcast::Sender<PlaybackNotice>,
}

impl PlaybackEngine {
    pub fn new(
        resolver: Arc<dyn TrackResolver>,
        sink: Arc<dyn AudioSink>,
        connector: Arc<dyn VoiceConnector>,
        settings: EngineSettings,
    ) -> Self {
        let (notices, _) = broadcast::channel(64);
        info!(
            "🎛️ Motor de reproducción listo (cola {}, historial {}, reintentos {})",
            settings.limits.max_size, settings.limits.max_history, settings.retry.max_retries
        );
        Self {
            resolver,
            sink,
            connector,
            settings,
            workers: DashMap::new(),
            notices,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackNotice> {
        self.notices.subscribe()
    }

    /// Joins `channel_id`, retrying a bounded number of times.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()> {
        self.request(guild_id, |reply| GuildCommand::Join { channel_id, reply })
            .await?
    }

    /// Resolves `query` and queues the result, starting playback if the guild is idle.
    ///
    /// Resolution happens before the guild worker is involved, so a failed
    /// lookup leaves the queue untouched.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        query: &str,
        requester: UserId,
    ) -> PlaybackResult<EnqueueOutcome> {
        let descriptors = self.resolver.resolve(query).await?;
        if descriptors.is_empty() {
            return Err(ResolutionError::NoResults(query.to_string()).into());
        }

        let tracks = descriptors
            .into_iter()
            .map(|descriptor| Track::from_descriptor(descriptor, requester))
            .collect();

        self.request(guild_id, |reply| GuildCommand::Enqueue { tracks, reply })
            .await
    }

    /// Starts the next track if nothing is playing. Returns the resulting state.
    #[cfg(test)]
    pub async fn advance(&self, guild_id: GuildId) -> PlaybackResult<PlaybackState> {
        self.request(guild_id, |reply| GuildCommand::Advance { reply })
            .await
    }

    /// Stops the current source; the next track starts from its completion.
    pub async fn skip(&self, guild_id: GuildId) -> PlaybackResult<Track> {
        self.request(guild_id, |reply| GuildCommand::Skip { reply })
            .await?
    }

    /// Clears the queue, stops playback and disconnects.
    pub async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.request(guild_id, |reply| GuildCommand::Stop { reply })
            .await
    }

    /// Like [`stop`](Self::stop), and forgets history too.
    pub async fn leave(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.request(guild_id, |reply| GuildCommand::Leave { reply })
            .await
    }

    /// The bot was removed from voice by someone else.
    pub fn handle_disconnected(&self, guild_id: GuildId) {
        if let Some(handle) = self.workers.get(&guild_id) {
            let _ = handle.tx.send(GuildCommand::Disconnected);
        }
    }

    pub async fn pause(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.with_worker(guild_id, |worker| worker.pause()).await?
    }

    pub async fn resume(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.with_worker(guild_id, |worker| worker.resume()).await?
    }

    /// `percent` in 0..=100; applies to the current source and later ones.
    pub async fn set_volume(&self, guild_id: GuildId, percent: u8) -> PlaybackResult<()> {
        if percent > 100 {
            return Err(PlaybackError::InvalidVolume(percent));
        }
        self.with_worker(guild_id, move |worker| worker.set_volume(percent))
            .await
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> PlaybackResult<()> {
        self.with_worker(guild_id, move |worker| worker.queue.set_loop_mode(mode))
            .await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.with_worker(guild_id, |worker| worker.queue.shuffle())
            .await
    }

    pub async fn clear(&self, guild_id: GuildId) -> PlaybackResult<usize> {
        self.with_worker(guild_id, |worker| worker.queue.clear())
            .await
    }

    /// Removes the track at a 1-based queue position.
    pub async fn remove_at(&self, guild_id: GuildId, position: usize) -> PlaybackResult<Track> {
        self.with_worker(guild_id, move |worker| {
            let len = worker.queue.len();
            let index = position
                .checked_sub(1)
                .ok_or(PlaybackError::InvalidIndex { position, len })?;
            worker.queue.remove_at(index).map_err(|_| PlaybackError::InvalidIndex { position, len })
        })
        .await?
    }

    /// Moves a track between 1-based queue positions.
    pub async fn move_to(&self, guild_id: GuildId, from: usize, to: usize) -> PlaybackResult<Track> {
        self.with_worker(guild_id, move |worker| worker.queue.move_to(from, to).cloned())
            .await?
    }

    #[cfg(test)]
    pub async fn list_queue(&self, guild_id: GuildId) -> PlaybackResult<Vec<Track>> {
        self.with_worker(guild_id, |worker| worker.queue.pending().cloned().collect())
            .await
    }

    pub async fn list_history(&self, guild_id: GuildId) -> PlaybackResult<Vec<Track>> {
        self.with_worker(guild_id, |worker| worker.queue.history().cloned().collect())
            .await
    }

    #[cfg(test)]
    pub async fn now_playing(&self, guild_id: GuildId) -> PlaybackResult<Option<Track>> {
        self.with_worker(guild_id, |worker| worker.queue.now_playing().cloned())
            .await
    }

    pub async fn state(&self, guild_id: GuildId) -> PlaybackResult<PlaybackState> {
        self.with_worker(guild_id, |worker| worker.state).await
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> PlaybackResult<GuildStatus> {
        self.with_worker(guild_id, |worker| GuildStatus {
            queue: worker.queue.snapshot(),
            state: worker.state,
            paused: worker.paused,
            retry_count: worker.queue.retry_count(),
        })
        .await
    }

    /// Leaves every guild. Used on shutdown.
    pub async fn leave_all(&self) {
        let guilds: Vec<GuildId> = self.workers.iter().map(|entry| *entry.key()).collect();
        let results = futures::future::join_all(guilds.iter().map(|guild_id| self.leave(*guild_id))).await;
        for (guild_id, result) in guilds.into_iter().zip(results) {
            if let Err(e) = result {
                warn!("No se pudo salir de la guild {} al apagar: {}", guild_id, e);
            }
        }
    }

    /// Runs `f` on the guild's worker and returns its result.
    async fn with_worker<R, F>(&self, guild_id: GuildId, f: F) -> PlaybackResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut GuildWorker) -> R + Send + 'static,
    {
        self.request(guild_id, |reply| {
            GuildCommand::With(Box::new(move |worker: &mut GuildWorker| {
                let _ = reply.send(f(worker));
            }))
        })
        .await
    }

    async fn request<R>(
        &self,
        guild_id: GuildId,
        build: impl FnOnce(oneshot::Sender<R>) -> GuildCommand,
    ) -> PlaybackResult<R> {
        let (reply, response) = oneshot::channel();
        self.worker(guild_id)
            .tx
            .send(build(reply))
            .map_err(|_| PlaybackError::WorkerUnavailable)?;
        response.await.map_err(|_| PlaybackError::WorkerUnavailable)
    }

    fn worker(&self, guild_id: GuildId) -> GuildHandle {
        if let Some(handle) = self.workers.get(&guild_id) {
            if !handle.tx.is_closed() {
                return handle.clone();
            }
        }

        self.workers
            .entry(guild_id)
            .and_modify(|handle| {
                if handle.tx.is_closed() {
                    warn!("El worker de la guild {} se había detenido, reiniciándolo", guild_id);
                    *handle = self.spawn_worker(guild_id);
                }
            })
            .or_insert_with(|| self.spawn_worker(guild_id))
            .clone()
    }

    fn spawn_worker(&self, guild_id: GuildId) -> GuildHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let worker = GuildWorker {
            guild_id,
            queue: GuildQueue::new(self.settings.limits, self.settings.default_volume),
            state: PlaybackState::Disconnected,
            paused: false,
            current: None,
            active_attempt: None,
            pending_retry: None,
            next_id: 0,
            skip_requested: false,
            settings: self.settings,
            sink: self.sink.clone(),
            connector: self.connector.clone(),
            notices: self.notices.clone(),
            commands_tx: tx.downgrade(),
            completions_tx,
        };

        debug!("Creando worker para guild {}", guild_id);
        tokio::spawn(worker.run(commands, completions));
        GuildHandle { tx }
    }
}

/// The serialized owner of one guild's queue, source and connection.
struct GuildWorker {
    guild_id: GuildId,
    queue: GuildQueue,
    state: PlaybackState,
    paused: bool,
    current: Option<Box<dyn SourceHandle>>,
    /// Completions for any other attempt are stale and ignored.
    active_attempt: Option<AttemptId>,
    pending_retry: Option<AttemptId>,
    next_id: AttemptId,
    skip_requested: bool,
    settings: EngineSettings,
    sink: Arc<dyn AudioSink>,
    connector: Arc<dyn VoiceConnector>,
    notices: broadcast::Sender<PlaybackNotice>,
    commands_tx: mpsc::WeakUnboundedSender<GuildCommand>,
    completions_tx: mpsc::UnboundedSender<PlaybackCompletion>,
}

impl GuildWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<GuildCommand>,
        mut completions: mpsc::UnboundedReceiver<PlaybackCompletion>,
    ) {
        loop {
            tokio::select! {
                // Primero las finalizaciones: deben llegar antes que cualquier comando posterior.
                biased;
                Some(done) = completions.recv() => self.on_completion(done).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        debug!("Worker de la guild {} detenido", self.guild_id);
    }

    async fn handle(&mut self, command: GuildCommand) {
        match command {
            GuildCommand::Join { channel_id, reply } => {
                let _ = reply.send(self.join(channel_id).await);
            }
            GuildCommand::Enqueue { tracks, reply } => {
                let outcome = self.enqueue(tracks).await;
                let _ = reply.send(outcome);
            }
            #[cfg(test)]
            GuildCommand::Advance { reply } => {
                if self.state == PlaybackState::Idle {
                    self.advance().await;
                }
                let _ = reply.send(self.state);
            }
            GuildCommand::Skip { reply } => {
                let _ = reply.send(self.skip().await);
            }
            GuildCommand::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            GuildCommand::Leave { reply } => {
                self.stop().await;
                self.queue.reset();
                let _ = reply.send(());
            }
            GuildCommand::Disconnected => self.on_disconnected(),
            GuildCommand::RetryDue { id } => self.on_retry_due(id).await,
            GuildCommand::With(f) => f(self),
        }
    }

    async fn join(&mut self, channel_id: ChannelId) -> PlaybackResult<()> {
        if self.state != PlaybackState::Disconnected && self.connector.is_connected(self.guild_id) {
            return Ok(());
        }

        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.connector.connect(self.guild_id, channel_id).await {
                Ok(()) => {
                    info!("🔊 Conectado al canal {} en guild {}", channel_id, self.guild_id);
                    if self.state == PlaybackState::Disconnected {
                        self.state = PlaybackState::Idle;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Intento de conexión de voz {}/{} fallido en guild {}: {}",
                        attempt, attempts, self.guild_id, e.reason
                    );
                    last_error = e.reason;
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.connect_retry_delay).await;
                    }
                }
            }
        }

        Err(ConnectionError::new(attempts, last_error).into())
    }

    async fn enqueue(&mut self, tracks: Vec<Track>) -> EnqueueOutcome {
        let before = self.queue.len();
        let mut evicted = 0;
        for track in &tracks {
            if self.queue.enqueue(track.clone()).is_some() {
                evicted += 1;
            }
        }
        info!("➕ {} canción(es) agregadas en guild {}", tracks.len(), self.guild_id);

        let mut started = false;
        if self.state == PlaybackState::Idle {
            self.advance().await;
            started = matches!(self.state, PlaybackState::Playing | PlaybackState::Awaiting);
        }

        let position = if started {
            None
        } else {
            Some((before + 1).saturating_sub(evicted).max(1))
        };

        EnqueueOutcome {
            added: tracks,
            evicted,
            position,
            started,
        }
    }

    /// Picks the next track by loop mode and starts it, or goes idle.
    async fn advance(&mut self) {
        if self.state == PlaybackState::Disconnected {
            debug!("Sin avanzar en guild {}: no hay conexión de voz", self.guild_id);
            return;
        }

        self.state = PlaybackState::Awaiting;
        let skip = std::mem::take(&mut self.skip_requested);
        let replay = self.queue.loop_mode() == LoopMode::Single && !skip;

        match self.queue.select_next(skip) {
            Some(track) => {
                if !replay {
                    self.queue.reset_retries();
                }
                self.start(track).await;
            }
            None => {
                info!("📭 Cola terminada en guild {}", self.guild_id);
                self.queue.reset_retries();
                self.state = PlaybackState::Idle;
                self.notify(PlaybackNotice::QueueFinished {
                    guild_id: self.guild_id,
                });
            }
        }
    }

    /// Opens `track` on the sink. `track` is already bound as now playing.
    async fn start(&mut self, track: Track) {
        self.state = PlaybackState::Awaiting;
        self.queue.set_now_playing(Some(track.clone()));

        let attempt = self.allocate_id();
        self.active_attempt = Some(attempt);
        let completion = Completion::new(attempt, self.completions_tx.clone());
        let volume = self.queue.volume();

        match self
            .sink
            .open(self.guild_id, &track.locator, volume, completion)
            .await
        {
            Ok(handle) => {
                if let Err(e) = handle.set_volume(volume) {
                    warn!("No se pudo aplicar el volumen en guild {}: {}", self.guild_id, e);
                }
                info!("🎵 Reproduciendo {} en guild {}", track.title, self.guild_id);
                self.queue.reset_retries();
                self.current = Some(handle);
                self.paused = false;
                self.state = PlaybackState::Playing;
                self.notify(PlaybackNotice::NowPlaying {
                    guild_id: self.guild_id,
                    track,
                });
            }
            Err(e) => self.on_sink_failure(e).await,
        }
    }

    async fn on_completion(&mut self, done: PlaybackCompletion) {
        if self.active_attempt != Some(done.attempt) {
            debug!(
                "Ignorando finalización obsoleta {} en guild {}",
                done.attempt, self.guild_id
            );
            return;
        }

        self.active_attempt = None;
        self.current = None;
        self.paused = false;

        match done.error {
            Some(e) if !self.skip_requested => self.on_sink_failure(e).await,
            Some(e) => {
                debug!("El source falló mientras se saltaba en guild {}: {}", self.guild_id, e);
                self.queue.reset_retries();
                self.advance().await;
            }
            None => {
                self.queue.reset_retries();
                self.advance().await;
            }
        }
    }

    async fn on_sink_failure(&mut self, error: SinkError) {
        self.active_attempt = None;
        self.current = None;
        self.skip_requested = false;

        let failures = self.queue.record_failure();
        match self.settings.retry.decide(failures) {
            RetryDecision::Retry { attempt, after } => {
                warn!(
                    "Falló la reproducción en guild {} (intento {}/{}): {}",
                    self.guild_id, attempt, self.settings.retry.max_retries, error
                );
                self.state = PlaybackState::Awaiting;
                self.schedule_retry(after);
            }
            RetryDecision::GiveUp => {
                error!(
                    "Máximo de reintentos alcanzado en guild {}, saliendo del canal de voz: {}",
                    self.guild_id, error
                );
                let track = self.queue.now_playing().cloned();
                // El voice-state update que sigue se ignora estando Disconnected,
                // así que la cola se limpia aquí.
                self.queue.clear();
                self.queue.retire_now_playing();
                self.queue.reset_retries();
                self.pending_retry = None;
                self.paused = false;
                self.cleanup_voice_client().await;
                self.state = PlaybackState::Disconnected;
                self.notify(PlaybackNotice::RetriesExhausted {
                    guild_id: self.guild_id,
                    track,
                });
            }
        }
    }

    fn schedule_retry(&mut self, after: Duration) {
        let id = self.allocate_id();
        self.pending_retry = Some(id);
        let tx = self.commands_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(GuildCommand::RetryDue { id });
            }
        });
    }

    async fn on_retry_due(&mut self, id: AttemptId) {
        if self.pending_retry != Some(id) {
            debug!("Ignorando reintento cancelado {} en guild {}", id, self.guild_id);
            return;
        }
        self.pending_retry = None;

        if self.state == PlaybackState::Disconnected {
            return;
        }

        match self.queue.now_playing().cloned() {
            Some(track) => {
                info!("🔄 Reintentando {} en guild {}", track.title, self.guild_id);
                self.start(track).await;
            }
            None => self.advance().await,
        }
    }

    async fn skip(&mut self) -> PlaybackResult<Track> {
        let skipped = self
            .queue
            .now_playing()
            .cloned()
            .ok_or(PlaybackError::NothingPlaying)?;

        if let Some(handle) = &self.current {
            self.skip_requested = true;
            match handle.stop() {
                Ok(()) => {
                    info!("⏭️ Saltando {} en guild {}", skipped.title, self.guild_id);
                    return Ok(skipped);
                }
                Err(e) => {
                    debug!("Falló el stop al saltar, avanzando directamente: {}", e);
                }
            }
        }

        // Esperando entre reintentos, o el source ya murió.
        self.pending_retry = None;
        self.active_attempt = None;
        self.current = None;
        self.skip_requested = true;
        self.advance().await;
        Ok(skipped)
    }

    async fn stop(&mut self) {
        self.queue.clear();
        self.pending_retry = None;
        self.skip_requested = false;
        self.queue.retire_now_playing();
        self.queue.reset_retries();
        self.cleanup_voice_client().await;
        self.state = PlaybackState::Disconnected;
        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        self.notify(PlaybackNotice::Disconnected {
            guild_id: self.guild_id,
        });
    }

    fn on_disconnected(&mut self) {
        if self.state == PlaybackState::Disconnected {
            return;
        }
        info!("🔌 Conexión de voz perdida en guild {}", self.guild_id);
        self.active_attempt = None;
        self.pending_retry = None;
        self.skip_requested = false;
        if let Some(handle) = self.current.take() {
            let _ = handle.stop();
        }
        self.queue.clear();
        self.queue.retire_now_playing();
        self.queue.reset_retries();
        self.paused = false;
        self.state = PlaybackState::Disconnected;
        self.notify(PlaybackNotice::Disconnected {
            guild_id: self.guild_id,
        });
    }

    /// Stops any source and forcibly disconnects. Never fails; errors are logged.
    async fn cleanup_voice_client(&mut self) {
        self.active_attempt = None;
        self.paused = false;

        if let Some(handle) = self.current.take() {
            if let Err(e) = handle.stop() {
                warn!("Error deteniendo el source en guild {}: {}", self.guild_id, e);
            }
        }

        if let Err(e) = self.connector.disconnect(self.guild_id).await {
            error!("Error limpiando la conexión de voz en guild {}: {}", self.guild_id, e);
        }
    }

    fn pause(&mut self) -> PlaybackResult<()> {
        if self.state == PlaybackState::Disconnected {
            return Err(PlaybackError::NotConnected);
        }
        let handle = self.current.as_ref().ok_or(PlaybackError::NothingPlaying)?;
        handle.pause()?;
        self.paused = true;
        info!("⏸️ Pausado en guild {}", self.guild_id);
        Ok(())
    }

    fn resume(&mut self) -> PlaybackResult<()> {
        if !self.paused {
            return Err(PlaybackError::NothingPlaying);
        }
        let handle = self.current.as_ref().ok_or(PlaybackError::NothingPlaying)?;
        handle.resume()?;
        self.paused = false;
        info!("▶️ Reanudado en guild {}", self.guild_id);
        Ok(())
    }

    fn set_volume(&mut self, percent: u8) {
        self.queue.set_volume(f32::from(percent) / 100.0);
        if let Some(handle) = &self.current {
            if let Err(e) = handle.set_volume(self.queue.volume()) {
                warn!("No se pudo cambiar el volumen en guild {}: {}", self.guild_id, e);
            }
        }
        info!("🔊 Volumen ajustado a {}% en guild {}", percent, self.guild_id);
    }

    fn allocate_id(&mut self) -> AttemptId {
        self.next_id += 1;
        self.next_id
    }

    fn notify(&self, notice: PlaybackNotice) {
        // Sin suscriptores no es un error.
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MockVoiceConnector;
    use crate::sources::{MockTrackResolver, TrackDescriptor};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct SinkLog {
        opened: Vec<String>,
        volumes: Vec<f32>,
        completions: Vec<Completion>,
        fail_next_opens: u32,
        stop_error: Option<SinkError>,
        stops: usize,
        paused: bool,
    }

    /// Records opens and keeps completions so tests decide when tracks end.
    #[derive(Clone, Default)]
    struct FakeSink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl FakeSink {
        fn fail_next_opens(&self, count: u32) {
            self.log.lock().fail_next_opens = count;
        }

        fn opened(&self) -> Vec<String> {
            self.log.lock().opened.clone()
        }

        /// Ends the most recently opened source.
        fn finish_current(&self, error: Option<SinkError>) {
            let completion = self.log.lock().completions.pop().expect("an open source");
            completion.finish(error);
        }
    }

    struct FakeHandle {
        attempt: AttemptId,
        log: Arc<Mutex<SinkLog>>,
    }

    impl SourceHandle for FakeHandle {
        fn set_volume(&self, volume: f32) -> Result<(), SinkError> {
            self.log.lock().volumes.push(volume);
            Ok(())
        }

        fn pause(&self) -> Result<(), SinkError> {
            self.log.lock().paused = true;
            Ok(())
        }

        fn resume(&self) -> Result<(), SinkError> {
            self.log.lock().paused = false;
            Ok(())
        }

        fn stop(&self) -> Result<(), SinkError> {
            let (completion, error) = {
                let mut log = self.log.lock();
                log.stops += 1;
                let index = log
                    .completions
                    .iter()
                    .position(|c| c.attempt() == self.attempt);
                (index.map(|i| log.completions.remove(i)), log.stop_error.take())
            };
            match completion {
                Some(completion) => {
                    completion.finish(error);
                    Ok(())
                }
                None => Err(SinkError::Control("already finished".into())),
            }
        }
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn open(
            &self,
            _guild_id: GuildId,
            locator: &str,
            volume: f32,
            completion: Completion,
        ) -> Result<Box<dyn SourceHandle>, SinkError> {
            let mut log = self.log.lock();
            log.opened.push(locator.to_string());
            if log.fail_next_opens > 0 {
                log.fail_next_opens -= 1;
                return Err(SinkError::Open(format!("cannot open {locator}")));
            }
            log.volumes.push(volume);
            let attempt = completion.attempt();
            log.completions.push(completion);
            Ok(Box::new(FakeHandle {
                attempt,
                log: self.log.clone(),
            }))
        }
    }

    fn resolver() -> MockTrackResolver {
        let mut resolver = MockTrackResolver::new();
        resolver.expect_resolve().returning(|query| {
            if query == "nothing" {
                return Ok(Vec::new());
            }
            if query == "broken" {
                return Err(ResolutionError::Extractor("HTTP 403".into()));
            }
            Ok(query
                .split(',')
                .map(|title| TrackDescriptor::new(title, format!("loc:{title}")).with_duration(60))
                .collect())
        });
        resolver
    }

    fn connector(disconnects: usize) -> MockVoiceConnector {
        let mut connector = MockVoiceConnector::new();
        connector.expect_connect().returning(|_, _| Ok(()));
        connector.expect_is_connected().returning(|_| true);
        connector
            .expect_disconnect()
            .times(disconnects)
            .returning(|_| Ok(()));
        connector
    }

    fn engine_with(sink: &FakeSink, connector: MockVoiceConnector) -> PlaybackEngine {
        PlaybackEngine::new(
            Arc::new(resolver()),
            Arc::new(sink.clone()),
            Arc::new(connector),
            EngineSettings::default(),
        )
    }

    const GUILD: GuildId = GuildId::new(10);
    const CHANNEL: ChannelId = ChannelId::new(20);
    const USER: UserId = UserId::new(30);

    fn titles(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|t| t.title.as_str()).collect()
    }

    async fn joined_engine(sink: &FakeSink, disconnects: usize) -> PlaybackEngine {
        let engine = engine_with(sink, connector(disconnects));
        engine.join(GUILD, CHANNEL).await.expect("join");
        engine
    }

    #[tokio::test]
    async fn new_guild_starts_disconnected() {
        let sink = FakeSink::default();
        let engine = engine_with(&sink, connector(0));
        assert_eq!(engine.state(GUILD).await.unwrap(), PlaybackState::Disconnected);
    }

    #[tokio::test]
    async fn enqueue_while_disconnected_only_queues() {
        let sink = FakeSink::default();
        let engine = engine_with(&sink, connector(0));

        let outcome = engine.enqueue(GUILD, "A", USER).await.unwrap();
        assert!(!outcome.started);
        assert_eq!(outcome.position, Some(1));
        assert!(sink.opened().is_empty());
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["A"]);
    }

    #[tokio::test]
    async fn advance_starts_tracks_queued_before_join() {
        let sink = FakeSink::default();
        let engine = engine_with(&sink, connector(0));
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        engine.join(GUILD, CHANNEL).await.unwrap();
        assert_eq!(engine.advance(GUILD).await.unwrap(), PlaybackState::Playing);
        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "A");

        // Ya está sonando: no cambia nada.
        assert_eq!(engine.advance(GUILD).await.unwrap(), PlaybackState::Playing);
        assert_eq!(sink.opened(), vec!["loc:A"]);
    }

    #[tokio::test]
    async fn plays_in_order_and_advances_on_completion() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;

        let first = engine.enqueue(GUILD, "A", USER).await.unwrap();
        assert!(first.started);
        engine.enqueue(GUILD, "B", USER).await.unwrap();
        let third = engine.enqueue(GUILD, "C", USER).await.unwrap();
        assert_eq!(third.position, Some(2));

        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "A");
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["B", "C"]);
        assert_eq!(engine.state(GUILD).await.unwrap(), PlaybackState::Playing);

        sink.finish_current(None);

        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "B");
        assert_eq!(titles(&engine.list_history(GUILD).await.unwrap()), vec!["A"]);
        assert_eq!(sink.opened(), vec!["loc:A", "loc:B"]);
    }

    #[tokio::test]
    async fn playlist_is_queued_in_order() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;

        let outcome = engine.enqueue(GUILD, "A,B,C", USER).await.unwrap();
        assert_eq!(outcome.added.len(), 3);
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn queue_runs_dry_to_idle_without_disconnecting() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        let mut notices = engine.subscribe();

        engine.enqueue(GUILD, "A", USER).await.unwrap();
        sink.finish_current(None);

        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.state, PlaybackState::Idle);
        assert!(status.queue.now_playing.is_none());
        assert_eq!(status.retry_count, 0);

        assert!(matches!(notices.recv().await, Ok(PlaybackNotice::NowPlaying { .. })));
        assert_eq!(
            notices.recv().await.unwrap(),
            PlaybackNotice::QueueFinished { guild_id: GUILD }
        );
    }

    #[tokio::test]
    async fn resolution_failure_leaves_queue_untouched() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;

        let err = engine.enqueue(GUILD, "broken", USER).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Resolution(_)));
        let err = engine.enqueue(GUILD, "nothing", USER).await.unwrap_err();
        assert_eq!(err, PlaybackError::from(ResolutionError::NoResults("nothing".into())));
        assert!(engine.list_queue(GUILD).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_loop_replays_current_track() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.set_loop_mode(GUILD, LoopMode::Single).await.unwrap();
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        for _ in 0..3 {
            sink.finish_current(None);
        }

        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "A");
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["B"]);
        assert!(engine.list_history(GUILD).await.unwrap().is_empty());
        assert_eq!(sink.opened(), vec!["loc:A"; 4]);
    }

    #[tokio::test]
    async fn skip_in_single_loop_moves_on() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.set_loop_mode(GUILD, LoopMode::Single).await.unwrap();
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        let skipped = engine.skip(GUILD).await.unwrap();
        assert_eq!(skipped.title, "A");
        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "B");
    }

    #[tokio::test]
    async fn queue_loop_recycles_history() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.set_loop_mode(GUILD, LoopMode::Queue).await.unwrap();
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        sink.finish_current(None); // A terminó, suena B
        assert_eq!(titles(&engine.list_history(GUILD).await.unwrap()), vec!["A"]);
        sink.finish_current(None); // B terminó, se recicla history [A, B]

        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "A");
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["B"]);
        assert!(engine.list_history(GUILD).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn skip_with_nothing_playing_fails() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        assert_eq!(engine.skip(GUILD).await.unwrap_err(), PlaybackError::NothingPlaying);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_same_track_after_backoff() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        sink.fail_next_opens(2);

        engine.enqueue(GUILD, "A,B", USER).await.unwrap();
        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.state, PlaybackState::Awaiting);
        assert_eq!(status.retry_count, 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;

        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.queue.now_playing.unwrap().title, "A");
        assert_eq!(titles(&status.queue.pending), vec!["B"]);
        assert_eq!(sink.opened(), vec!["loc:A"; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_error_counts_as_failure() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        sink.finish_current(Some(SinkError::Playback("decoder died".into())));
        assert_eq!(engine.snapshot(GUILD).await.unwrap().retry_count, 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.opened(), vec!["loc:A", "loc:A"]);
        assert_eq!(engine.snapshot(GUILD).await.unwrap().retry_count, 0);

        sink.finish_current(None);
        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.queue.now_playing.unwrap().title, "B");
        assert_eq!(titles(&status.queue.history), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_disconnect() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 1).await;
        let mut notices = engine.subscribe();
        sink.fail_next_opens(3);

        engine.enqueue(GUILD, "A,B", USER).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.state, PlaybackState::Disconnected);
        assert_eq!(status.retry_count, 0);
        assert!(status.queue.now_playing.is_none());
        assert!(status.queue.pending.is_empty());
        assert_eq!(titles(&status.queue.history), vec!["A"]);
        assert_eq!(sink.opened(), vec!["loc:A"; 3]);

        match notices.recv().await {
            Ok(PlaybackNotice::RetriesExhausted { guild_id, track }) => {
                assert_eq!(guild_id, GUILD);
                assert_eq!(track.map(|t| t.title), Some("A".to_string()));
            }
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_after_exhausted_retries_plays_the_new_request() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 1).await;
        sink.fail_next_opens(3);

        engine.enqueue(GUILD, "A,B", USER).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.state(GUILD).await.unwrap(), PlaybackState::Disconnected);

        engine.join(GUILD, CHANNEL).await.unwrap();
        let outcome = engine.enqueue(GUILD, "C", USER).await.unwrap();

        assert!(outcome.started);
        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "C");
        assert!(engine.list_queue(GUILD).await.unwrap().is_empty());
        assert_eq!(sink.opened(), vec!["loc:A", "loc:A", "loc:A", "loc:C"]);
    }

    #[tokio::test]
    async fn skipped_source_ending_in_error_still_skips() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.set_loop_mode(GUILD, LoopMode::Single).await.unwrap();
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();
        sink.log.lock().stop_error = Some(SinkError::Playback("broken pipe".into()));

        engine.skip(GUILD).await.unwrap();
        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.queue.now_playing.unwrap().title, "B");
        assert_eq!(status.retry_count, 0);

        // El skip ya se consumió, así que Single repite B.
        sink.finish_current(None);
        engine.state(GUILD).await.unwrap();
        assert_eq!(sink.opened(), vec!["loc:A", "loc:B", "loc:B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_during_backoff_cancels_retry() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        sink.fail_next_opens(1);

        engine.enqueue(GUILD, "A,B", USER).await.unwrap();
        engine.skip(GUILD).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "B");
        assert_eq!(sink.opened(), vec!["loc:A", "loc:B"]);
    }

    #[tokio::test]
    async fn stop_clears_queue_and_disconnects() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 1).await;
        engine.enqueue(GUILD, "A,B,C", USER).await.unwrap();

        engine.stop(GUILD).await.unwrap();

        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.state, PlaybackState::Disconnected);
        assert!(status.queue.pending.is_empty());
        assert!(status.queue.now_playing.is_none());
        assert_eq!(titles(&status.queue.history), vec!["A"]);
        // La finalización del propio stop es obsoleta y no debe reiniciar nada.
        assert_eq!(sink.opened(), vec!["loc:A"]);
    }

    #[tokio::test]
    async fn leave_forgets_history_but_keeps_settings() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 1).await;
        engine.set_loop_mode(GUILD, LoopMode::Queue).await.unwrap();
        engine.set_volume(GUILD, 80).await.unwrap();
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        engine.leave(GUILD).await.unwrap();

        let status = engine.snapshot(GUILD).await.unwrap();
        assert!(status.queue.history.is_empty());
        assert!(status.queue.pending.is_empty());
        assert_eq!(status.queue.loop_mode, LoopMode::Queue);
        assert_eq!(status.queue.volume, 0.8);
    }

    #[tokio::test]
    async fn cleanup_swallows_disconnect_errors() {
        let sink = FakeSink::default();
        let mut connector = MockVoiceConnector::new();
        connector.expect_connect().returning(|_, _| Ok(()));
        connector.expect_is_connected().returning(|_| true);
        connector
            .expect_disconnect()
            .times(1)
            .returning(|_| Err(ConnectionError::new(1, "gateway closed")));
        let engine = engine_with(&sink, connector);
        engine.join(GUILD, CHANNEL).await.unwrap();

        assert_eq!(engine.stop(GUILD).await, Ok(()));
        assert_eq!(engine.state(GUILD).await.unwrap(), PlaybackState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn join_retries_then_fails() {
        let sink = FakeSink::default();
        let mut connector = MockVoiceConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|_, _| Err(ConnectionError::new(1, "timed out")));
        let engine = engine_with(&sink, connector);

        let err = engine.join(GUILD, CHANNEL).await.unwrap_err();
        assert_eq!(err, PlaybackError::from(ConnectionError::new(3, "timed out")));
        assert_eq!(engine.state(GUILD).await.unwrap(), PlaybackState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn join_succeeds_on_second_attempt() {
        let sink = FakeSink::default();
        let mut connector = MockVoiceConnector::new();
        let mut calls = 0;
        connector.expect_connect().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(ConnectionError::new(1, "timed out"))
            } else {
                Ok(())
            }
        });
        let engine = engine_with(&sink, connector);

        engine.join(GUILD, CHANNEL).await.unwrap();
        assert_eq!(engine.state(GUILD).await.unwrap(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn external_disconnect_resets_queue() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        engine.handle_disconnected(GUILD);

        let status = engine.snapshot(GUILD).await.unwrap();
        assert_eq!(status.state, PlaybackState::Disconnected);
        assert!(status.queue.pending.is_empty());
        assert!(status.queue.now_playing.is_none());
        assert_eq!(sink.opened(), vec!["loc:A"]);
    }

    #[tokio::test]
    async fn volume_applies_to_current_and_next_sources() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        engine.enqueue(GUILD, "A,B", USER).await.unwrap();

        engine.set_volume(GUILD, 30).await.unwrap();
        assert_eq!(engine.set_volume(GUILD, 150).await, Err(PlaybackError::InvalidVolume(150)));
        sink.finish_current(None);
        engine.state(GUILD).await.unwrap();

        let volumes = sink.log.lock().volumes.clone();
        assert_eq!(volumes, vec![0.5, 0.5, 0.3, 0.3, 0.3]);
    }

    #[tokio::test]
    async fn pause_and_resume_reach_the_source() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        assert_eq!(engine.pause(GUILD).await, Err(PlaybackError::NothingPlaying));

        engine.enqueue(GUILD, "A", USER).await.unwrap();
        engine.pause(GUILD).await.unwrap();
        assert!(sink.log.lock().paused);
        assert!(engine.snapshot(GUILD).await.unwrap().paused);

        engine.resume(GUILD).await.unwrap();
        assert!(!sink.log.lock().paused);
        assert_eq!(engine.resume(GUILD).await, Err(PlaybackError::NothingPlaying));
    }

    #[tokio::test]
    async fn queue_edits_use_one_based_positions() {
        let sink = FakeSink::default();
        let engine = engine_with(&sink, connector(0));
        engine.enqueue(GUILD, "A,B,C", USER).await.unwrap();

        let moved = engine.move_to(GUILD, 3, 1).await.unwrap();
        assert_eq!(moved.title, "C");
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["C", "A", "B"]);

        let removed = engine.remove_at(GUILD, 2).await.unwrap();
        assert_eq!(removed.title, "A");
        assert_eq!(
            engine.remove_at(GUILD, 0).await,
            Err(PlaybackError::InvalidIndex { position: 0, len: 2 })
        );
        assert_eq!(
            engine.remove_at(GUILD, 3).await,
            Err(PlaybackError::InvalidIndex { position: 3, len: 2 })
        );
        assert_eq!(titles(&engine.list_queue(GUILD).await.unwrap()), vec!["C", "B"]);
    }

    #[tokio::test]
    async fn guilds_are_independent() {
        let sink = FakeSink::default();
        let engine = joined_engine(&sink, 0).await;
        let other = GuildId::new(11);

        engine.enqueue(GUILD, "A", USER).await.unwrap();
        engine.enqueue(other, "X,Y", USER).await.unwrap();
        engine.shuffle(other).await.unwrap();

        assert_eq!(engine.state(other).await.unwrap(), PlaybackState::Disconnected);
        assert_eq!(engine.list_queue(other).await.unwrap().len(), 2);
        assert_eq!(engine.now_playing(GUILD).await.unwrap().unwrap().title, "A");
    }
}
