//! Durable audit trail of applied mutations
//!
//! Commits hand their records to an [`AuditWriter`], which forwards them to
//! an [`AuditLog`] backend on a blocking thread. Persistence is best-effort
//! after commit: a failed append is logged and never undoes the in-memory
//! state. The file backend stores length-prefixed bincode frames that
//! [`FileAuditLog::read_all`] turns back into records for replay.

use crate::error::AuditError;
use log::{error, warn};
use parking_lot::Mutex;
use shared::AuditRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Frames larger than this are refused on write and treated as corruption on read
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub trait AuditLog: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Keeps records in memory; useful for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Append-only file of `u32` little-endian length prefixed bincode frames
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete frame. A truncated final frame (a crash mid-append)
    /// ends the stream without error.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_LEN {
                return Err(AuditError::FrameTooLarge(len));
            }

            let mut frame = vec![0u8; len];
            match reader.read_exact(&mut frame) {
                Ok(()) => records.push(AuditRecord::decode(&frame)?),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!("Ignoring truncated audit frame of {} bytes", len);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(records)
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let frame = record.encode()?;
        if frame.len() > MAX_FRAME_LEN {
            return Err(AuditError::FrameTooLarge(frame.len()));
        }

        let mut writer = self.writer.lock();
        writer.write_all(&(frame.len() as u32).to_le_bytes())?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }
}

enum AuditCommand {
    Append(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Queue in front of an [`AuditLog`], drained on a blocking thread
pub struct AuditWriter {
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl AuditWriter {
    pub fn start(log: Arc<dyn AuditLog>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    AuditCommand::Append(record) => {
                        if let Err(e) = log.append(&record) {
                            error!("Failed to persist audit record for {}: {}", record.user_id(), e);
                        }
                    }
                    AuditCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    pub fn record(&self, record: AuditRecord) {
        if self.tx.send(AuditCommand::Append(record)).is_err() {
            warn!("Audit writer stopped, record not persisted");
        }
    }

    /// Resolves once every earlier record has been handed to the backend
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(AuditCommand::Flush(done_tx))
            .map_err(|_| AuditError::Closed)?;
        done_rx.await.map_err(|_| AuditError::Closed)
    }
}
