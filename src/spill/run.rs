use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{EngineError, Result};

/// A spilled run on disk. The file is deleted when the handle is dropped,
/// which covers merge completion, operator teardown and failure paths alike.
#[derive(Debug)]
pub struct SpilledRun {
    run_id: usize,
    path: PathBuf,
    record_count: usize,
    file_size_bytes: u64,
}

impl SpilledRun {
    pub fn run_id(&self) -> usize {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes
    }

    /// Opens the run for sequential reading. The reader takes ownership, so
    /// the file goes away once the reader is dropped.
    pub fn into_reader<T: DeserializeOwned>(self, io_buffer_size: usize) -> Result<RunReader<T>> {
        let file = File::open(&self.path).map_err(|e| EngineError::io(&self.path, e))?;
        Ok(RunReader {
            reader: BufReader::with_capacity(io_buffer_size, file),
            line: String::new(),
            finished: false,
            run: self,
            _record: PhantomData,
        })
    }
}

impl Drop for SpilledRun {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove spill run {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Writes one run as newline-delimited JSON records.
pub struct RunWriter<T> {
    writer: BufWriter<File>,
    run: SpilledRun,
    _record: PhantomData<fn(&T)>,
}

impl<T: Serialize> RunWriter<T> {
    pub(crate) fn create(run_id: usize, path: PathBuf, io_buffer_size: usize) -> Result<Self> {
        let file = File::create(&path).map_err(|e| EngineError::io(&path, e))?;
        Ok(Self {
            writer: BufWriter::with_capacity(io_buffer_size, file),
            run: SpilledRun {
                run_id,
                path,
                record_count: 0,
                file_size_bytes: 0,
            },
            _record: PhantomData,
        })
    }

    pub fn append(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| EngineError::run_format(&self.run.path, e))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| EngineError::io(&self.run.path, e))?;
        self.run.record_count += 1;
        Ok(())
    }

    /// Flushes and seals the run. A writer dropped before `finish` removes its
    /// partial file.
    pub fn finish(mut self) -> Result<SpilledRun> {
        self.writer
            .flush()
            .map_err(|e| EngineError::io(&self.run.path, e))?;
        self.run.file_size_bytes = std::fs::metadata(&self.run.path)
            .map_err(|e| EngineError::io(&self.run.path, e))?
            .len();
        let RunWriter { writer, run, .. } = self;
        drop(writer);
        Ok(run)
    }
}

/// Lazily decodes the records of a run in the order they were written.
pub struct RunReader<T> {
    // Declared before `run` so the file is closed before it is deleted
    reader: BufReader<File>,
    line: String,
    finished: bool,
    run: SpilledRun,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for RunReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => {
                self.finished = true;
                None
            }
            Ok(_) => match serde_json::from_str(self.line.trim_end()) {
                Ok(record) => Some(Ok(record)),
                Err(e) => {
                    self.finished = true;
                    Some(Err(EngineError::run_format(&self.run.path, e)))
                }
            },
            Err(e) => {
                self.finished = true;
                Some(Err(EngineError::io(&self.run.path, e)))
            }
        }
    }
}
