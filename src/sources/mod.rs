pub mod ytdlp;

use async_trait::async_trait;

use crate::audio::error::ResolutionError;

pub use ytdlp::YtDlpResolver;

/// What a resolver knows about one playable item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub title: String,
    /// Seconds, `0` when the extractor does not know.
    pub duration_secs: u64,
    pub stream_locator: String,
    pub thumbnail_url: Option<String>,
}

impl TrackDescriptor {
    pub fn new(title: impl Into<String>, stream_locator: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            duration_secs: 0,
            stream_locator: stream_locator.into(),
            thumbnail_url: None,
        }
    }

    pub fn with_duration(mut self, duration_secs: u64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    pub fn with_thumbnail(mut self, thumbnail_url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(thumbnail_url.into());
        self
    }
}

/// Turns a user query (search terms or URL) into track descriptors.
/// Playlists expand into several descriptors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Vec<TrackDescriptor>, ResolutionError>;
}

/// `true` for absolute http(s) URLs, `false` for free-text searches.
pub fn is_url(query: &str) -> bool {
    url::Url::parse(query.trim())
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}
