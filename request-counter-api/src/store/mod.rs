use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Seek, SeekFrom, Write},
    path::Path,
    time::SystemTime,
};

/// Request timestamps in arrival order, oldest first.
pub type RequestLog = VecDeque<SystemTime>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open counter file, error: {0}")]
    Open(std::io::Error),
    #[error("Failed to read counter file, error: {0}")]
    Read(std::io::Error),
    #[error("Failed to decode counter file, error: {0}")]
    Decode(bincode::Error),
    #[error("Failed to encode request log, error: {0}")]
    Encode(bincode::Error),
    #[error("Failed to write counter file, error: {0}")]
    Write(std::io::Error),
    #[error("Failed to sync counter file, error: {0}")]
    Sync(std::io::Error),
    #[error("Counter store is already closed")]
    Closed,
}

/// Persistence seam for the counter. Backends only need to round-trip the
/// request log; the counter and its worker never see a file handle.
pub trait CounterStore: Send {
    fn load(&mut self) -> Result<RequestLog, StoreError>;
    fn save(&mut self, requests: &RequestLog) -> Result<(), StoreError>;
    fn close(&mut self) -> Result<(), StoreError>;
}

/// File-backed store. The whole log is bincode-encoded into a single file,
/// rewritten from scratch on every save.
pub struct FileStore {
    file: Option<File>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(StoreError::Open)?;

        Ok(Self { file: Some(file) })
    }
}

impl CounterStore for FileStore {
    fn load(&mut self) -> Result<RequestLog, StoreError> {
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;

        // A fresh file holds no log yet.
        if file.metadata().map_err(StoreError::Read)?.len() == 0 {
            return Ok(RequestLog::new());
        }

        file.seek(SeekFrom::Start(0)).map_err(StoreError::Read)?;

        bincode::deserialize_from(BufReader::new(file)).map_err(StoreError::Decode)
    }

    fn save(&mut self, requests: &RequestLog) -> Result<(), StoreError> {
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;

        // Destructive overwrite: once the truncate lands the previous log is
        // gone, so a crash before sync_all loses the persisted data.
        file.set_len(0).map_err(StoreError::Write)?;
        file.seek(SeekFrom::Start(0)).map_err(StoreError::Write)?;

        let mut writer = BufWriter::new(&mut *file);
        bincode::serialize_into(&mut writer, requests).map_err(StoreError::Encode)?;
        writer.flush().map_err(StoreError::Write)?;
        drop(writer);

        file.sync_all().map_err(StoreError::Sync)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        let file = self.file.take().ok_or(StoreError::Closed)?;

        file.sync_all().map_err(StoreError::Sync)
    }
}
