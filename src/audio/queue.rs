use chrono::{DateTime, Utc};
use rand::{seq::SliceRandom, Rng};
use serenity::model::id::UserId;
use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};
use tracing::{debug, info};

use super::error::{PlaybackError, PlaybackResult};
use crate::sources::TrackDescriptor;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// A resolved, playable track. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    /// Opaque locator handed to the audio sink.
    pub locator: String,
    /// Seconds, `0` when unknown.
    pub duration_secs: u64,
    pub thumbnail: Option<String>,
    pub requested_by: UserId,
    pub enqueued_at: DateTime<Utc>,
}

impl Track {
    #[cfg(test)]
    pub fn new(title: impl Into<String>, locator: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            title: title.into(),
            locator: locator.into(),
            duration_secs: 0,
            thumbnail: None,
            requested_by,
            enqueued_at: Utc::now(),
        }
    }

    pub fn from_descriptor(descriptor: TrackDescriptor, requested_by: UserId) -> Self {
        Self {
            title: descriptor.title,
            locator: descriptor.stream_locator,
            duration_secs: descriptor.duration_secs,
            thumbnail: descriptor.thumbnail_url,
            requested_by,
            enqueued_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Single,
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopMode::Off => "off",
            LoopMode::Single => "single",
            LoopMode::Queue => "queue",
        };
        f.write_str(name)
    }
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Ok(LoopMode::Off),
            "single" | "track" | "one" | "1" => Ok(LoopMode::Single),
            "queue" | "all" | "2" => Ok(LoopMode::Queue),
            other => Err(format!("modo de loop desconocido `{other}`")),
        }
    }
}

/// Capacity bounds for one guild's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_size: usize,
    pub max_history: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_QUEUE_SIZE,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// Per-guild queue state. Pure data and transitions, no I/O.
///
/// At capacity, `enqueue` evicts the oldest pending track (never the one
/// playing). `history` is bounded the same way.
#[derive(Debug)]
pub struct GuildQueue {
    pending: VecDeque<Track>,
    history: VecDeque<Track>,
    now_playing: Option<Track>,
    loop_mode: LoopMode,
    volume: f32,
    retry_count: u32,
    limits: QueueLimits,
}

impl GuildQueue {
    pub fn new(limits: QueueLimits, default_volume: f32) -> Self {
        Self {
            pending: VecDeque::with_capacity(limits.max_size.min(64)),
            history: VecDeque::new(),
            now_playing: None,
            loop_mode: LoopMode::Off,
            volume: default_volume.clamp(0.0, 1.0),
            retry_count: 0,
            limits,
        }
    }

    /// Appends to `pending`, returning the track evicted to make room, if any.
    pub fn enqueue(&mut self, track: Track) -> Option<Track> {
        if self.limits.max_size == 0 {
            return Some(track);
        }

        let evicted = if self.pending.len() >= self.limits.max_size {
            self.pending.pop_front()
        } else {
            None
        };

        if let Some(ref old) = evicted {
            info!("📤 Cola llena, se descartó la más antigua: {}", old.title);
        }
        debug!("➕ Agregado a la cola: {}", track.title);
        self.pending.push_back(track);
        evicted
    }

    /// Pops the head of `pending` into `history` and returns it.
    #[cfg(test)]
    pub fn dequeue_next(&mut self) -> Option<Track> {
        let track = self.pending.pop_front()?;
        self.push_history(track.clone());
        Some(track)
    }

    /// Picks what plays next according to the loop mode and binds it as now playing.
    ///
    /// `Single` replays the current track unless `skip_current` is set. Otherwise the
    /// current track is retired into `history` first, and `Queue` refills `pending`
    /// from `history` once it runs dry.
    pub fn select_next(&mut self, skip_current: bool) -> Option<Track> {
        if self.loop_mode == LoopMode::Single && !skip_current {
            if let Some(current) = self.now_playing.clone() {
                debug!("🔂 Repitiendo: {}", current.title);
                return Some(current);
            }
        }

        self.retire_now_playing();

        if self.pending.is_empty() && self.loop_mode == LoopMode::Queue {
            self.recycle_history();
        }

        let next = self.pending.pop_front()?;
        self.now_playing = Some(next.clone());
        Some(next)
    }

    /// Moves the current track (if any) to the tail of `history`.
    pub fn retire_now_playing(&mut self) -> Option<&Track> {
        let finished = self.now_playing.take()?;
        self.push_history(finished);
        self.history.back()
    }

    /// Moves all of `history` back into `pending`, oldest first.
    pub fn recycle_history(&mut self) -> usize {
        let recycled = self.history.len();
        for track in self.history.drain(..) {
            self.pending.push_back(track);
        }
        while self.pending.len() > self.limits.max_size {
            self.pending.pop_front();
        }
        if recycled > 0 {
            info!("🔁 {} canción(es) recicladas del historial", recycled);
        }
        recycled
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        debug!("🗑️ Limpiadas {} canción(es) pendientes", cleared);
        cleared
    }

    /// Drops queue, history and now playing. Loop mode and volume survive.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.history.clear();
        self.now_playing = None;
        self.retry_count = 0;
    }

    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut rand::thread_rng());
    }

    /// Uniform in-place permutation of `pending`.
    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.pending.make_contiguous().shuffle(rng);
        debug!("🔀 Mezcladas {} canción(es) pendientes", self.pending.len());
    }

    /// Removes the track at a 0-based index.
    pub fn remove_at(&mut self, index: usize) -> PlaybackResult<Track> {
        let len = self.pending.len();
        let track = self
            .pending
            .remove(index)
            .ok_or(PlaybackError::InvalidIndex { position: index, len })?;
        debug!("❌ Removida {} de la posición {}", track.title, index);
        Ok(track)
    }

    /// Moves a track between two 1-based positions.
    pub fn move_to(&mut self, from: usize, to: usize) -> PlaybackResult<&Track> {
        let len = self.pending.len();
        for position in [from, to] {
            if position == 0 || position > len {
                return Err(PlaybackError::InvalidIndex { position, len });
            }
        }

        let track = self
            .pending
            .remove(from - 1)
            .ok_or(PlaybackError::InvalidIndex { position: from, len })?;
        self.pending.insert(to - 1, track);
        debug!("📍 Canción movida de {} a {}", from, to);

        self.pending
            .get(to - 1)
            .ok_or(PlaybackError::InvalidIndex { position: to, len })
    }

    pub fn set_now_playing(&mut self, track: Option<Track>) {
        self.now_playing = track;
    }

    pub fn now_playing(&self) -> Option<&Track> {
        self.now_playing.as_ref()
    }

    pub fn pending(&self) -> impl ExactSizeIterator<Item = &Track> {
        self.pending.iter()
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &Track> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        info!("🔁 Modo loop: {}", mode);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Counts one more sink failure and returns the new total.
    pub fn record_failure(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    pub fn reset_retries(&mut self) {
        self.retry_count = 0;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            now_playing: self.now_playing.clone(),
            pending: self.pending.iter().cloned().collect(),
            history: self.history.iter().cloned().collect(),
            loop_mode: self.loop_mode,
            volume: self.volume,
            total_duration: self.total_duration(),
        }
    }

    fn push_history(&mut self, track: Track) {
        self.history.push_back(track);
        while self.history.len() > self.limits.max_history {
            self.history.pop_front();
        }
    }

    fn total_duration(&self) -> Duration {
        let queued: Duration = self.pending.iter().filter_map(Track::duration).sum();
        let current = self
            .now_playing
            .as_ref()
            .and_then(Track::duration)
            .unwrap_or_default();
        queued + current
    }
}

/// Point-in-time copy of a guild's queue, safe to hand outside the worker.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub now_playing: Option<Track>,
    pub pending: Vec<Track>,
    pub history: Vec<Track>,
    pub loop_mode: LoopMode,
    pub volume: f32,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    /// One page of `pending` (1-based page numbers).
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let total_items = self.pending.len();
        let total_pages = total_items.div_ceil(per_page).max(1);
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * per_page;
        let end = (start + per_page).min(total_items);

        QueuePage {
            items: self.pending.get(start..end).map(<[Track]>::to_vec).unwrap_or_default(),
            first_position: start + 1,
            current_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    /// 1-based queue position of `items[0]`.
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
