//! # Audio Module
//!
//! Per-guild playback: queue state, the playback engine and the songbird
//! backend that actually moves audio.
//!
//! ### [`queue`] - Queue state
//! - Pending tracks, bounded history and the currently bound track
//! - Loop modes (`off`, `single`, `queue`), shuffle, positional edits
//!
//! ### [`engine`] - Playback engine
//! - One worker task per guild, so every guild's operations are serialized
//! - Track transitions driven by completion events from the sink
//! - Bounded retries with backoff, then a forced disconnect
//!
//! ### [`songbird_sink`] - Songbird backend
//! - Opens yt-dlp or direct HTTP inputs on the guild's `Call`
//! - Joins and leaves voice channels
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use serenity::all::{ChannelId, GuildId, UserId};
//! # use voice_queue::audio::engine::{EngineSettings, PlaybackEngine};
//! # async fn example(engine: Arc<PlaybackEngine>) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//!
//! engine.join(guild_id, ChannelId::new(42)).await?;
//! engine.enqueue(guild_id, "never gonna give you up", UserId::new(7)).await?;
//!
//! engine.pause(guild_id).await?;
//! engine.resume(guild_id).await?;
//! engine.skip(guild_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod songbird_sink;
