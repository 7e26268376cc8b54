pub type KaravaResult<T> = Result<T, KaravaError>;

#[derive(thiserror::Error, Debug)]
pub enum KaravaError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Upstream frame renderer failure (bundling, metadata resolution, or
    /// per-frame rendering). Not retried; resubmission is the recovery path.
    #[error("render error: {0}")]
    Render(String),

    /// External compositing failure: malformed filter graph or nonzero
    /// ffmpeg exit.
    #[error("compositing error: {0}")]
    Compositing(String),

    /// The external process exited cleanly but never produced the declared
    /// output file. Kept separate from [`KaravaError::Compositing`] because
    /// it points at encoder/driver misconfiguration, not a transient fault.
    #[error("compositing produced no output file: {0}")]
    MissingOutput(String),

    /// Deliberate user-triggered abort. Not a failure; the orchestrator
    /// maps this to the `cancelled` terminal status.
    #[error("render cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KaravaError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn compositing(msg: impl Into<String>) -> Self {
        Self::Compositing(msg.into())
    }

    pub fn missing_output(msg: impl Into<String>) -> Self {
        Self::MissingOutput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
