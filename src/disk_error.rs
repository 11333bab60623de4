//! Disk fault dispatch: maps corruption and IO faults to a configured
//! policy, quarantining directories and stopping transports where the
//! policy calls for it.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::lifecycle::Tracker;

/// What to do when a disk fault is reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFailurePolicy {
    /// No action.
    Ignore,
    /// Quarantine the failing directory and keep serving what remains.
    BestEffort,
    /// Stop serving network transports; keep the process for diagnostics.
    Stop,
    /// As `Stop`, also applied to corruption faults.
    StopParanoid,
    /// Terminate the process immediately.
    Die,
}

/// A fault reported by the storage layer.
#[derive(Clone, Debug)]
pub enum DiskFault {
    Corruption { file: PathBuf, reason: String },
    Read { file: PathBuf },
    Write { file: PathBuf },
    /// The disk holding `file` is out of space.
    DiskFull { file: PathBuf },
    /// No data directory remains writable.
    NoWritableDisk,
}

impl DiskFault {
    pub fn file(&self) -> Option<&Path> {
        match self {
            DiskFault::Corruption { file, .. }
            | DiskFault::Read { file }
            | DiskFault::Write { file }
            | DiskFault::DiskFull { file } => Some(file),
            DiskFault::NoWritableDisk => None,
        }
    }

    fn is_read(&self) -> bool {
        matches!(self, DiskFault::Read { .. })
    }

    /// Faults the node cannot operate through even under best effort.
    fn stops_transports(&self) -> bool {
        matches!(self, DiskFault::DiskFull { .. } | DiskFault::NoWritableDisk)
    }
}

impl Display for DiskFault {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DiskFault::Corruption { file, reason } => {
                write!(f, "corrupt sstable {}: {reason}", file.display())
            }
            DiskFault::Read { file } => write!(f, "read fault on {}", file.display()),
            DiskFault::Write { file } => write!(f, "write fault on {}", file.display()),
            DiskFault::DiskFull { file } => write!(f, "disk full writing {}", file.display()),
            DiskFault::NoWritableDisk => write!(f, "no writable data directory"),
        }
    }
}

/// Seam for stopping the node's client-facing transports.
pub trait TransportControl: Send + Sync {
    fn stop_transports(&self);
}

/// Seam for killing the process; real deployments exit, tests record.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// Default terminator: log and exit the process.
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, reason: &str) {
        tracing::error!(reason, "terminating process due to disk failure policy");
        std::process::exit(1);
    }
}

/// Directories quarantined after faults. Unwritable directories take no new
/// files; unreadable ones additionally have their sstables dropped.
#[derive(Default)]
pub struct DisallowedDirectories {
    unwritable: Mutex<HashSet<PathBuf>>,
    unreadable: Mutex<HashSet<PathBuf>>,
}

impl DisallowedDirectories {
    fn directory_of(file: &Path) -> Option<PathBuf> {
        let dir = file.parent()?;
        Some(std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()))
    }

    /// Marks the file's directory unwritable, returning it when newly marked.
    pub fn maybe_mark_unwritable(&self, file: &Path) -> Option<PathBuf> {
        let dir = Self::directory_of(file)?;
        if self.unwritable.lock().unwrap().insert(dir.clone()) {
            tracing::warn!(directory = %dir.display(), "marking directory unwritable");
            Some(dir)
        } else {
            None
        }
    }

    /// Marks the file's directory unreadable, returning it when newly marked.
    pub fn maybe_mark_unreadable(&self, file: &Path) -> Option<PathBuf> {
        let dir = Self::directory_of(file)?;
        if self.unreadable.lock().unwrap().insert(dir.clone()) {
            tracing::warn!(directory = %dir.display(), "marking directory unreadable");
            Some(dir)
        } else {
            None
        }
    }

    pub fn is_unwritable(&self, dir: &Path) -> bool {
        self.unwritable.lock().unwrap().contains(dir)
    }

    pub fn is_unreadable(&self, dir: &Path) -> bool {
        self.unreadable.lock().unwrap().contains(dir)
    }
}

/// Receives faults and applies the configured policy.
pub struct DiskErrorHandler {
    policy: DiskFailurePolicy,
    setup_complete: AtomicBool,
    transports: Arc<dyn TransportControl>,
    terminator: Arc<dyn Terminator>,
    disallowed: DisallowedDirectories,
    trackers: RwLock<Vec<Arc<Tracker>>>,
}

impl DiskErrorHandler {
    pub fn new(
        policy: DiskFailurePolicy,
        transports: Arc<dyn TransportControl>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            policy,
            setup_complete: AtomicBool::new(false),
            transports,
            terminator,
            disallowed: DisallowedDirectories::default(),
            trackers: RwLock::new(Vec::new()),
        }
    }

    /// Trackers registered here get drop requests for unreadable directories.
    pub fn register_tracker(&self, tracker: Arc<Tracker>) {
        self.trackers.write().unwrap().push(tracker);
    }

    /// Startup is over; faults are now handled per policy instead of
    /// failing fast.
    pub fn mark_setup_complete(&self) {
        self.setup_complete.store(true, Ordering::SeqCst);
    }

    pub fn disallowed(&self) -> &DisallowedDirectories {
        &self.disallowed
    }

    pub fn handle(&self, fault: &DiskFault) {
        tracing::error!(fault = %fault, policy = ?self.policy, "disk fault");

        // before setup completes there is no partial state worth saving
        if !self.setup_complete.load(Ordering::SeqCst)
            && !matches!(
                self.policy,
                DiskFailurePolicy::Ignore | DiskFailurePolicy::BestEffort
            )
        {
            self.terminator.terminate("disk fault during startup");
            return;
        }

        match self.policy {
            DiskFailurePolicy::Die => self.terminator.terminate("disk failure policy is die"),
            DiskFailurePolicy::Stop | DiskFailurePolicy::StopParanoid => {
                self.transports.stop_transports();
            }
            DiskFailurePolicy::BestEffort => self.best_effort(fault),
            DiskFailurePolicy::Ignore => {}
        }
    }

    fn best_effort(&self, fault: &DiskFault) {
        if fault.stops_transports() {
            self.transports.stop_transports();
        }
        let Some(file) = fault.file() else {
            return;
        };
        self.disallowed.maybe_mark_unwritable(file);
        if fault.is_read() {
            if let Some(directory) = self.disallowed.maybe_mark_unreadable(file) {
                for tracker in self.trackers.read().unwrap().iter() {
                    if let Err(e) = tracker.remove_unreadable(&directory) {
                        tracing::error!(
                            table = %tracker.metadata(),
                            directory = %directory.display(),
                            error = %e,
                            "failed to drop sstables from unreadable directory"
                        );
                    }
                }
            }
        }
    }
}
