//! Durable obsoletion log: crash recovery for partially-completed swaps.
//!
//! Every transaction that replaces sstables writes one append-only log file
//! named `<uuid>_<opkind>.oblog` in the table directory. Records describe
//! the files being added and removed, followed by a commit or abort marker:
//!
//! ```text
//! +--------+----------+---------+----------+
//! | tag:u8 | len:u32  | payload | crc32:u32|
//! +--------+----------+---------+----------+
//! ```
//!
//! The log is synced on commit before any file deletion begins. On startup,
//! every unfinished log is resolved: a committed log deletes its REMOVE
//! targets and keeps its ADD targets; anything else deletes the ADD targets
//! and keeps the REMOVE targets. Either way a valid live set is restored.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use itertools::Itertools;
use uuid::Uuid;

use super::OperationKind;
use crate::descriptor::{Component, Descriptor};
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const RECORD_ADD: u8 = 0x01;
const RECORD_REMOVE: u8 = 0x02;
const RECORD_COMMIT: u8 = 0x03;
const RECORD_ABORT: u8 = 0x04;

pub const OBLOG_EXTENSION: &str = "oblog";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogState {
    Prepared,
    Committed,
    Aborted,
}

/// Write-ahead record of one transaction's file replacements. The backing
/// file is created lazily on the first record, so a transaction that stages
/// nothing leaves nothing behind.
pub struct ObsoletionLog {
    path: PathBuf,
    id: Uuid,
    op: OperationKind,
    file: Option<File>,
    state: LogState,
}

impl ObsoletionLog {
    pub fn new(table_dir: &Path, op: OperationKind, id: Uuid) -> Self {
        let path = table_dir.join(format!("{}_{}.{}", id, op.as_str(), OBLOG_EXTENSION));
        Self {
            path,
            id,
            op,
            file: None,
            state: LogState::Prepared,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn op(&self) -> OperationKind {
        self.op
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once any record has been written to disk.
    pub fn has_records(&self) -> bool {
        self.file.is_some()
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("log file was just opened"))
    }

    fn append(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(payload.len() + 9);
        record.write_u8(tag)?;
        record.write_u32::<BigEndian>(payload.len() as u32)?;
        record.extend_from_slice(payload);
        let checksum = CRC32.checksum(&record);
        record.write_u32::<BigEndian>(checksum)?;
        self.file()?.write_all(&record)?;
        Ok(())
    }

    fn append_descriptor(&mut self, tag: u8, descriptor: &Descriptor) -> Result<()> {
        debug_assert_eq!(self.state, LogState::Prepared);
        let data_path = descriptor.file_for(Component::Data);
        self.append(tag, data_path.to_string_lossy().as_bytes())
    }

    /// Records that `descriptor`'s files are being introduced by this
    /// transaction, to be deleted should it never commit.
    pub fn record_add(&mut self, descriptor: &Descriptor) -> Result<()> {
        self.append_descriptor(RECORD_ADD, descriptor)
    }

    /// Records that `descriptor`'s files are being replaced, to be deleted
    /// once the transaction commits.
    pub fn record_remove(&mut self, descriptor: &Descriptor) -> Result<()> {
        self.append_descriptor(RECORD_REMOVE, descriptor)
    }

    /// Forces written records to disk so progress survives a crash.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Appends the commit marker and fsyncs. After this returns, recovery
    /// will complete the swap rather than roll it back. A second call is a
    /// no-op; committing an aborted log is an invariant violation.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            LogState::Committed => return Ok(()),
            LogState::Aborted => {
                return Err(Error::Invariant(format!(
                    "cannot commit aborted obsoletion log {}",
                    self.id
                )))
            }
            LogState::Prepared => {}
        }
        if self.file.is_some() {
            self.append(RECORD_COMMIT, &[])
                .and_then(|()| self.sync())
                .map_err(|e| Error::ObsoletionFailed(e.to_string()))?;
        }
        self.state = LogState::Committed;
        Ok(())
    }

    /// Appends the abort marker; recovery then rolls the transaction back.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != LogState::Prepared {
            return Ok(());
        }
        if self.file.is_some() {
            self.append(RECORD_ABORT, &[])?;
            self.sync()?;
        }
        self.state = LogState::Aborted;
        Ok(())
    }
}

/// Outcome of resolving one log file at startup.
#[derive(Debug)]
pub struct RecoveredLog {
    pub id: Uuid,
    pub op: Option<OperationKind>,
    pub committed: bool,
    /// Data-file paths whose sstables were deleted during recovery.
    pub deleted: Vec<PathBuf>,
}

/// Resolves every obsoletion log left in `table_dir` by a previous process.
pub fn recover_obsoletion_logs(table_dir: &Path) -> Result<Vec<RecoveredLog>> {
    if !table_dir.is_dir() {
        return Ok(Vec::new());
    }

    let log_files: Vec<PathBuf> = fs::read_dir(table_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == OBLOG_EXTENSION))
        .sorted()
        .collect();

    let mut recovered = Vec::new();
    for path in log_files {
        let Some((id, op)) = parse_log_name(&path) else {
            tracing::warn!(log = %path.display(), "skipping unparseable obsoletion log name");
            continue;
        };

        let records = read_records(&path)?;
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut committed = false;
        for (tag, payload) in records {
            match tag {
                RECORD_ADD => adds.push(PathBuf::from(String::from_utf8_lossy(&payload).as_ref())),
                RECORD_REMOVE => {
                    removes.push(PathBuf::from(String::from_utf8_lossy(&payload).as_ref()))
                }
                RECORD_COMMIT => committed = true,
                RECORD_ABORT => committed = false,
                other => {
                    tracing::warn!(log = %path.display(), tag = other, "unknown obsoletion record");
                }
            }
        }

        let targets = if committed { &removes } else { &adds };
        let mut deleted = Vec::new();
        for data_path in targets {
            delete_sstable_files(data_path)?;
            deleted.push(data_path.clone());
        }
        fs::remove_file(&path)?;

        tracing::info!(
            id = %id,
            committed,
            deleted = deleted.len(),
            "recovered obsoletion log"
        );
        recovered.push(RecoveredLog {
            id,
            op,
            committed,
            deleted,
        });
    }
    Ok(recovered)
}

fn parse_log_name(path: &Path) -> Option<(Uuid, Option<OperationKind>)> {
    let stem = path.file_stem()?.to_str()?;
    let (id, op) = stem.split_once('_')?;
    Some((Uuid::parse_str(id).ok()?, OperationKind::parse(op)))
}

/// Reads records until end of file, treating a torn or corrupt tail as the
/// end of the log.
fn read_records(path: &Path) -> Result<Vec<(u8, Vec<u8>)>> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut at = 0usize;
    while at < data.len() {
        if at + 5 > data.len() {
            tracing::warn!(log = %path.display(), "torn record header, truncating log");
            break;
        }
        let tag = data[at];
        let len = u32::from_be_bytes(data[at + 1..at + 5].try_into().expect("4 bytes")) as usize;
        let end = at + 5 + len;
        if end + 4 > data.len() {
            tracing::warn!(log = %path.display(), "torn record payload, truncating log");
            break;
        }
        let checksum = u32::from_be_bytes(data[end..end + 4].try_into().expect("4 bytes"));
        if CRC32.checksum(&data[at..end]) != checksum {
            tracing::warn!(log = %path.display(), "record checksum mismatch, truncating log");
            break;
        }
        records.push((tag, data[at + 5..end].to_vec()));
        at = end + 4;
    }
    Ok(records)
}

/// Deletes every component of the sstable whose data file is `data_path`.
fn delete_sstable_files(data_path: &Path) -> Result<()> {
    let remove = |p: PathBuf| match fs::remove_file(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from(e)),
    };
    match Descriptor::from_file(data_path) {
        Ok((descriptor, _)) => {
            for component in Component::ALL {
                remove(descriptor.file_for(component))?;
            }
            Ok(())
        }
        Err(_) => remove(data_path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SSTableFormat;

    fn descriptor(dir: &Path, generation: u64) -> Descriptor {
        Descriptor::new(dir, "ks", "cf", generation, SSTableFormat::Big)
    }

    fn create_files(descriptor: &Descriptor) {
        for component in [Component::Data, Component::Statistics] {
            fs::write(descriptor.file_for(component), b"x").unwrap();
        }
    }

    #[test]
    fn test_empty_log_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ObsoletionLog::new(dir.path(), OperationKind::DropTable, Uuid::new_v4());
        log.commit().unwrap();
        assert!(!log.path().exists());
        assert_eq!(log.state(), LogState::Committed);
    }

    #[test]
    fn test_commit_is_idempotent_and_abort_after_commit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let d = descriptor(dir.path(), 1);
        let mut log = ObsoletionLog::new(dir.path(), OperationKind::Compaction, Uuid::new_v4());
        log.record_remove(&d).unwrap();
        log.commit().unwrap();
        log.commit().unwrap();

        let mut aborted = ObsoletionLog::new(dir.path(), OperationKind::Compaction, Uuid::new_v4());
        aborted.record_add(&d).unwrap();
        aborted.abort().unwrap();
        assert!(aborted.commit().is_err());
    }

    #[test]
    fn test_recovery_of_uncommitted_log_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let original = descriptor(dir.path(), 1);
        let staged = descriptor(dir.path(), 2);
        create_files(&original);
        create_files(&staged);

        // crash after staging, before the commit marker
        let mut log = ObsoletionLog::new(dir.path(), OperationKind::Compaction, Uuid::new_v4());
        log.record_add(&staged).unwrap();
        log.record_remove(&original).unwrap();
        log.sync().unwrap();
        drop(log);

        let recovered = recover_obsoletion_logs(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(!recovered[0].committed);

        assert!(original.file_for(Component::Data).exists());
        assert!(!staged.file_for(Component::Data).exists());
        assert!(!staged.file_for(Component::Statistics).exists());

        // the log itself is gone, so a second pass is a no-op
        assert!(recover_obsoletion_logs(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_recovery_of_committed_log_completes_swap() {
        let dir = tempfile::tempdir().unwrap();
        let original = descriptor(dir.path(), 1);
        let staged = descriptor(dir.path(), 2);
        create_files(&original);
        create_files(&staged);

        // crash after the commit marker, before deleting the originals
        let mut log = ObsoletionLog::new(dir.path(), OperationKind::Compaction, Uuid::new_v4());
        log.record_add(&staged).unwrap();
        log.record_remove(&original).unwrap();
        log.commit().unwrap();
        drop(log);

        let recovered = recover_obsoletion_logs(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].committed);

        assert!(!original.file_for(Component::Data).exists());
        assert!(staged.file_for(Component::Data).exists());
    }

    #[test]
    fn test_torn_tail_treated_as_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let staged = descriptor(dir.path(), 2);
        create_files(&staged);

        let mut log = ObsoletionLog::new(dir.path(), OperationKind::Compaction, Uuid::new_v4());
        log.record_add(&staged).unwrap();
        log.commit().unwrap();
        let path = log.path().to_path_buf();
        drop(log);

        // chop the commit marker off the tail
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let recovered = recover_obsoletion_logs(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(!recovered[0].committed);
        assert!(!staged.file_for(Component::Data).exists());
    }
}
