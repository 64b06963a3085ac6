//! Error types for jukebox-core.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (cache directory, index file, config file).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Cache index (de)serialisation error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config write: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),

    /// A search query resolved to nothing playable.
    #[error("no search result for '{0}'")]
    NoSearchResult(String),
}
