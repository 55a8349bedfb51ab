use thiserror::Error;

/// A query could not be turned into playable tracks.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    #[error("sin resultados para `{0}`")]
    NoResults(String),

    #[error("falló el extractor: {0}")]
    Extractor(String),

    #[error("no se pudo interpretar la salida del extractor: {0}")]
    Parse(String),
}

/// Opening or playing a stream failed. Retried by the engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    #[error("no hay conexión a un canal de voz")]
    NoConnection,

    #[error("no se pudo abrir el stream: {0}")]
    Open(String),

    #[error("falló la reproducción: {0}")]
    Playback(String),

    #[error("falló el control del track: {0}")]
    Control(String),
}

/// Joining (or leaving) a voice channel failed.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("falló la conexión de voz tras {attempts} intento(s): {reason}")]
pub struct ConnectionError {
    pub attempts: u32,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            attempts,
            reason: reason.into(),
        }
    }
}

/// Everything the engine can report back to the command layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("la posición {position} está fuera de rango (la cola tiene {len} canción(es))")]
    InvalidIndex { position: usize, len: usize },

    #[error("el volumen debe estar entre 0 y 100, se recibió {0}")]
    InvalidVolume(u8),

    #[error("no hay conexión a un canal de voz")]
    NotConnected,

    #[error("no hay nada reproduciéndose")]
    NothingPlaying,

    #[error("el worker de la guild no está activo")]
    WorkerUnavailable,
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;
