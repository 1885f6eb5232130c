// SPDX-License-Identifier: AGPL-3.0-only

//! Serialized path-output stream shared by every device worker.
//!
//! Each line is `slot_index:x,y,z` — one line per seed at write time, one
//! per retained path position at harvest time. Writers on different threads
//! must not interleave partial lines, so every write goes through one mutex;
//! harvests batch a whole bank's lines into a single locked write.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::TrackError;

/// Append-only, mutex-serialized path stream.
pub struct PathSink {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl PathSink {
    /// Create a sink writing to a file at `path`.
    pub fn create(path: &Path) -> Result<Self, TrackError> {
        let file = File::create(path)
            .map_err(|e| TrackError::PathOutput(format!("{}: {e}", path.display())))?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Create a sink over an arbitrary writer (tests, pipes).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    /// Format one `slot:x,y,z` line.
    pub fn format_line(slot: u32, pos: [f32; 3]) -> String {
        format!("{slot}:{:.6},{:.6},{:.6}\n", pos[0], pos[1], pos[2])
    }

    /// Append one seed/position line.
    pub fn write_line(&self, slot: u32, pos: [f32; 3]) -> Result<(), TrackError> {
        self.write_block(&Self::format_line(slot, pos))
    }

    /// Append a pre-formatted block of lines under a single lock, so one
    /// harvest's records never interleave with another worker's.
    pub fn write_block(&self, block: &str) -> Result<(), TrackError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TrackError::PathOutput("sink lock poisoned".into()))?;
        writer
            .write_all(block.as_bytes())
            .map_err(|e| TrackError::PathOutput(e.to_string()))
    }

    /// Flush buffered output (call once after all workers join).
    pub fn flush(&self) -> Result<(), TrackError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TrackError::PathOutput("sink lock poisoned".into()))?;
        writer
            .flush()
            .map_err(|e| TrackError::PathOutput(e.to_string()))
    }
}
