//! The OCR capability consumed by the watch protocol.
//!
//! Character recognition itself (bitmap extraction, training data, glyph
//! matching) lives outside this crate; the engine only needs the
//! [`OcrEngine`] trait and the [`Grid`] of recognized console lines it
//! returns. The shipped implementation, [`CommandOcr`], wraps an external
//! recognizer binary the same way a simulator wrapper shells out to platform
//! tooling.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

/// Errors produced by the OCR capability.
#[derive(Error, Debug)]
pub enum OcrError {
    /// The recognizer process failed or returned a non-zero exit code.
    #[error("recognizer failed: {0}")]
    CommandFailed(String),

    /// The recognizer produced output that is not valid UTF-8 text.
    #[error("invalid recognizer output: {0}")]
    InvalidOutput(String),

    /// An I/O error occurred while launching the recognizer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Geometry and training inputs for a recognition pass.
#[derive(Debug, Clone)]
pub struct OcrGeometry {
    /// Path to the persisted character-bitmap-to-glyph mapping.
    pub training_data: PathBuf,
    /// Console width in character cells.
    pub columns: u32,
    /// Console height in character cells.
    pub rows: u32,
}

/// Recognized console text: one string per console row, top to bottom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grid {
    lines: Vec<String>,
}

impl Grid {
    /// Builds a grid from recognized lines.
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// The recognized lines in row order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether any line contains `query` as a substring.
    ///
    /// Matching is exact and case-sensitive unless `ignore_case` is set.
    pub fn contains(&self, query: &str, ignore_case: bool) -> bool {
        self.find(query, ignore_case).is_some()
    }

    /// Returns the 1-based row number of the first line containing `query`.
    pub fn find(&self, query: &str, ignore_case: bool) -> Option<usize> {
        if ignore_case {
            let query = query.to_lowercase();
            self.lines
                .iter()
                .position(|l| l.to_lowercase().contains(&query))
                .map(|i| i + 1)
        } else {
            self.lines
                .iter()
                .position(|l| l.contains(query))
                .map(|i| i + 1)
        }
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Something that can turn a console screenshot into recognized text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognizes the console text in `image` using the given training data
    /// and console geometry.
    async fn recognize(&self, image: &Path, geometry: &OcrGeometry) -> Result<Grid, OcrError>;
}

/// OCR engine that shells out to an external recognizer executable.
///
/// The recognizer is invoked as
/// `<program> <image> <training-data> <columns> <rows>` and must print one
/// recognized line per console row on stdout.
pub struct CommandOcr {
    program: PathBuf,
}

impl CommandOcr {
    /// Creates an engine backed by the given recognizer binary.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for CommandOcr {
    async fn recognize(&self, image: &Path, geometry: &OcrGeometry) -> Result<Grid, OcrError> {
        let output = tokio::process::Command::new(&self.program)
            .arg(image)
            .arg(&geometry.training_data)
            .arg(geometry.columns.to_string())
            .arg(geometry.rows.to_string())
            .output()
            .await?;

        if !output.status.success() {
            return Err(OcrError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|e| OcrError::InvalidOutput(e.to_string()))?;
        let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        trace!(rows = lines.len(), "recognized console text");
        Ok(Grid::new(lines))
    }
}
