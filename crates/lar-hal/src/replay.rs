//! JSON-Lines capture recordings.
//!
//! One [`CaptureEvent`] per line, in the order it was captured. A recording
//! made with [`ReplayWriter`] can be fed back through [`ReplaySource`] to
//! re-run a mapping session deterministically.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use lar_types::LarError;
use tracing::debug;

use crate::capture::{CaptureEvent, CaptureSource};

fn capture_error(path: &Path, details: impl ToString) -> LarError {
    LarError::Capture {
        device: path.display().to_string(),
        details: details.to_string(),
    }
}

/// Plays back a JSON-Lines recording.
pub struct ReplaySource {
    id: String,
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl ReplaySource {
    /// Open a recording for playback.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LarError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| capture_error(&path, e))?;
        Ok(Self {
            id: path.display().to_string(),
            lines: BufReader::new(file).lines(),
            path,
            line_no: 0,
        })
    }
}

impl CaptureSource for ReplaySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn next_event(&mut self) -> Result<Option<CaptureEvent>, LarError> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.map_err(|e| capture_error(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| {
                capture_error(&self.path, format!("line {}: {e}", self.line_no))
            })?;
            return Ok(Some(event));
        }
        Ok(None)
    }
}

/// Writes capture events to a JSON-Lines recording.
pub struct ReplayWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl ReplayWriter {
    /// Create (or truncate) a recording at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LarError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| capture_error(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn record(&mut self, event: &CaptureEvent) -> Result<(), LarError> {
        serde_json::to_writer(&mut self.out, event)
            .map_err(|e| LarError::Serialization(e.to_string()))?;
        self.out
            .write_all(b"\n")
            .map_err(|e| capture_error(&self.path, e))?;
        self.written += 1;
        Ok(())
    }

    /// Drain `source` into the recording; returns the number of events.
    pub fn record_all(&mut self, source: &mut dyn CaptureSource) -> Result<usize, LarError> {
        let before = self.written;
        while let Some(event) = source.next_event()? {
            self.record(&event)?;
        }
        Ok(self.written - before)
    }

    /// Flush buffered events to disk.
    pub fn finish(mut self) -> Result<usize, LarError> {
        self.out.flush().map_err(|e| capture_error(&self.path, e))?;
        debug!(path = %self.path.display(), events = self.written, "recording closed");
        Ok(self.written)
    }
}
