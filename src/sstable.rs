//! Reference-counted handles to immutable on-disk sstables.
//!
//! The live view owns a strong reference to every readable sstable; readers
//! clone a reference and keep the file pinned for as long as they hold it.
//! Marking a handle obsolete defers physical deletion to the drop of the
//! last reference, which is what keeps concurrent readers safe from
//! dangling files.

use std::fs;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::descriptor::{Component, Descriptor};
use crate::dht::Token;
use crate::error::{Error, Result};

/// Handle to one immutable sstable.
pub struct SSTableReader {
    descriptor: Descriptor,
    components: Vec<Component>,
    bytes_on_disk: u64,
    first: Token,
    last: Token,
    repaired: AtomicBool,
    obsolete: AtomicBool,
}

impl SSTableReader {
    /// Open a handle over existing component files. The data component must
    /// be present; `bytes_on_disk` is the sum over all components.
    pub fn open(descriptor: Descriptor, components: Vec<Component>) -> Result<Arc<Self>> {
        if !components.contains(&Component::Data) {
            return Err(Error::Corruption(format!(
                "{descriptor} has no data component"
            )));
        }
        let mut bytes_on_disk = 0;
        for component in &components {
            bytes_on_disk += fs::metadata(descriptor.file_for(*component))?.len();
        }
        // without reading content we only know the sstable may span the ring
        Ok(Arc::new(Self {
            descriptor,
            components,
            bytes_on_disk,
            first: Token(i64::MIN),
            last: Token(i64::MAX),
            repaired: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        }))
    }

    /// A fully in-memory handle with explicit size and key interval. No
    /// component files need to exist; obsoletion tolerates their absence.
    pub fn for_testing(
        descriptor: Descriptor,
        bytes_on_disk: u64,
        first: Token,
        last: Token,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            components: vec![Component::Data],
            bytes_on_disk,
            first,
            last,
            repaired: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.bytes_on_disk
    }

    /// Smallest ring position covered by this sstable.
    pub fn first(&self) -> Token {
        self.first
    }

    /// Largest ring position covered by this sstable.
    pub fn last(&self) -> Token {
        self.last
    }

    pub fn is_repaired(&self) -> bool {
        self.repaired.load(Ordering::SeqCst)
    }

    pub fn set_repaired(&self, repaired: bool) {
        self.repaired.store(repaired, Ordering::SeqCst);
    }

    /// Schedule the component files for deletion once the last reference to
    /// this handle drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        for component in Component::ALL {
            match fs::remove_file(self.descriptor.file_for(component)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        sstable = %self.descriptor,
                        component = %component,
                        error = %e,
                        "failed to delete obsolete component"
                    );
                }
            }
        }
        tracing::debug!(sstable = %self.descriptor, "deleted obsolete sstable");
    }
}

impl PartialEq for SSTableReader {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
    }
}

impl Eq for SSTableReader {}

impl Hash for SSTableReader {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.descriptor.hash(state);
    }
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("descriptor", &self.descriptor)
            .field("bytes_on_disk", &self.bytes_on_disk)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}
