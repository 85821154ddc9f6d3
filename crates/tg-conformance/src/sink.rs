use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tg_serialize::StreamHasher;

use crate::HarnessError;

/// Line-oriented artifact writer. Lines go to a temporary file beside the
/// destination, which replaces the destination only on [`commit`]. A sink
/// dropped before commit leaves any previous artifact untouched.
///
/// [`commit`]: ArtifactSink::commit
#[derive(Debug)]
pub struct ArtifactSink {
    destination: PathBuf,
    writer: BufWriter<NamedTempFile>,
    hasher: StreamHasher,
    line_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReceipt {
    pub path: PathBuf,
    pub line_count: usize,
    pub source_hash: String,
}

impl ArtifactSink {
    pub fn create(destination: impl Into<PathBuf>) -> Result<Self, HarnessError> {
        let destination = destination.into();
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&parent).map_err(|error| HarnessError::io(&parent, &error))?;
        let temp =
            NamedTempFile::new_in(&parent).map_err(|error| HarnessError::io(&destination, &error))?;
        Ok(Self {
            destination,
            writer: BufWriter::new(temp),
            hasher: StreamHasher::new(),
            line_count: 0,
        })
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), HarnessError> {
        writeln!(self.writer, "{line}")
            .map_err(|error| HarnessError::io(&self.destination, &error))?;
        self.hasher.write_line(line);
        self.line_count += 1;
        Ok(())
    }

    pub fn commit(self) -> Result<SinkReceipt, HarnessError> {
        let Self {
            destination,
            writer,
            hasher,
            line_count,
        } = self;
        let temp = writer
            .into_inner()
            .map_err(|error| HarnessError::io(&destination, error.error()))?;
        temp.as_file()
            .sync_all()
            .map_err(|error| HarnessError::io(&destination, &error))?;
        temp.persist(&destination)
            .map_err(|error| HarnessError::io(&destination, &error.error))?;
        Ok(SinkReceipt {
            path: destination,
            line_count,
            source_hash: hasher.finish(),
        })
    }
}
