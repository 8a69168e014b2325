use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while writing logs and diagrams.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure the logger: {0}")]
    Logger(String),

    #[error("failed to write the diagram: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to parse the font {}", .0.display())]
    Font(PathBuf),

    #[error("model '{0}' has no layers to draw")]
    EmptyModel(String),
}
