use async_process::Command;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{is_url, TrackDescriptor, TrackResolver};
use crate::audio::error::ResolutionError;

/// Resolves queries by shelling out to yt-dlp.
pub struct YtDlpResolver {
    program: String,
    cookies: Option<PathBuf>,
    max_entries: usize,
    // yt-dlp recibe rate limit rápido si muchas guilds buscan a la vez
    permits: Semaphore,
}

/// The subset of yt-dlp's JSON we read. Playlists nest entries.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    url: Option<String>,
    entries: Option<Vec<Option<YtDlpInfo>>>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<String>, cookies: Option<PathBuf>, max_entries: usize) -> Self {
        Self {
            program: program.into(),
            cookies,
            max_entries: max_entries.max(1),
            permits: Semaphore::new(3),
        }
    }

    /// Runs `yt-dlp --version`, returning the version string.
    pub async fn check_available(&self) -> Result<String, ResolutionError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ResolutionError::Extractor(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(ResolutionError::Extractor(format!(
                "{} --version terminó con {}",
                self.program, output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn build_args(&self, query: &str) -> Vec<String> {
        let query = query.trim();
        let target = if is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{query}")
        };

        let mut args: Vec<String> = [
            "--dump-single-json",
            "--flat-playlist",
            "--skip-download",
            "--no-warnings",
            "--socket-timeout",
            "30",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("--playlist-end".to_string());
        args.push(self.max_entries.to_string());

        if let Some(cookies) = &self.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }

        args.push(target);
        args
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ResolutionError::Extractor(e.to_string()))?;

        info!("🔍 Buscando: {}", query);

        let output = Command::new(&self.program)
            .args(self.build_args(query))
            .output()
            .await
            .map_err(|e| ResolutionError::Extractor(format!("no se pudo ejecutar {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para `{}`: {}", query, stderr.trim());
            return Err(ResolutionError::Extractor(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let descriptors = parse_output(&stdout)?;
        if descriptors.is_empty() {
            return Err(ResolutionError::NoResults(query.to_string()));
        }

        debug!("`{}` resuelto en {} canción(es)", query, descriptors.len());
        Ok(descriptors)
    }
}

/// Parses `--dump-single-json` output, expanding playlists.
fn parse_output(json: &str) -> Result<Vec<TrackDescriptor>, ResolutionError> {
    let info: YtDlpInfo =
        serde_json::from_str(json).map_err(|e| ResolutionError::Parse(e.to_string()))?;

    let mut descriptors = Vec::new();
    collect(info, &mut descriptors);
    Ok(descriptors)
}

fn collect(info: YtDlpInfo, out: &mut Vec<TrackDescriptor>) {
    if let Some(entries) = info.entries {
        for entry in entries.into_iter().flatten() {
            collect(entry, out);
        }
        return;
    }

    let Some(locator) = info.webpage_url.or(info.original_url).or(info.url) else {
        debug!("Saltando entrada sin URL: {:?}", info.title);
        return;
    };

    let duration_secs = info
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d.round() as u64)
        .unwrap_or(0);

    let thumbnail = info
        .thumbnail
        .or_else(|| info.thumbnails.into_iter().last().map(|t| t.url));

    let mut descriptor = TrackDescriptor::new(
        info.title.unwrap_or_else(|| "Desconocido".to_string()),
        locator,
    )
    .with_duration(duration_secs);
    if let Some(thumbnail) = thumbnail {
        descriptor = descriptor.with_thumbnail(thumbnail);
    }
    out.push(descriptor);
}
