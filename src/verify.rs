//! Offline sstable verification, backing the `sstableverify` tool.
//!
//! Verification works at the file level: component presence, readability,
//! format version and token ownership. Sstables missing their data component
//! are skipped as incomplete rather than failed, since an interrupted
//! transaction may legitimately leave them behind until recovery runs.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::descriptor::{sstable_lister, Component, Descriptor, SSTableFormat};
use crate::dht::{Range, Token};
use crate::error::{Error, Result};
use crate::sstable::SSTableReader;

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Re-read every component in full instead of just the data file.
    pub extended: bool,
    /// Require the latest on-disk format.
    pub check_version: bool,
    /// Permit writing a new repair status on successfully verified sstables.
    pub mutate_repair_status: bool,
    /// Skip reading data entirely.
    pub quick: bool,
    /// When non-empty, restrict the ownership check to these ranges.
    pub token_ranges: Vec<Range>,
}

#[derive(Debug, Default)]
pub struct VerifyOutcome {
    pub verified: usize,
    pub failed: Vec<(Descriptor, Error)>,
}

impl VerifyOutcome {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Locates `<data>/<ks>/<cf>-<id>/`, accepting a legacy `<ks>/<cf>` layout.
pub fn find_table_dir(data_dir: &Path, keyspace: &str, table: &str) -> Result<PathBuf> {
    let unknown = || Error::InvalidInput(format!("Unknown keyspace/table {keyspace}.{table}"));

    let keyspace_dir = data_dir.join(keyspace);
    if !keyspace_dir.is_dir() {
        return Err(unknown());
    }
    let prefix = format!("{table}-");
    for entry in fs::read_dir(&keyspace_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let id_suffix = name.strip_prefix(&prefix);
        let matches = name == table
            || id_suffix.map_or(false, |id| {
                !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit())
            });
        if matches {
            return Ok(entry.path());
        }
    }
    Err(unknown())
}

/// Verifies every complete sstable of the table. Per-sstable failures are
/// collected in the outcome; only setup problems return `Err`.
pub fn verify_table(
    data_dir: &Path,
    keyspace: &str,
    table: &str,
    options: &VerifyOptions,
) -> Result<VerifyOutcome> {
    let table_dir = find_table_dir(data_dir, keyspace, table)?;
    let mut outcome = VerifyOutcome::default();

    for (descriptor, components) in sstable_lister(&table_dir)? {
        if !components.contains(&Component::Data) {
            tracing::debug!(sstable = %descriptor, "skipping incomplete sstable");
            continue;
        }
        match SSTableReader::open(descriptor.clone(), components) {
            Ok(sstable) => match verify_sstable(&sstable, options) {
                Ok(()) => outcome.verified += 1,
                Err(e) => outcome.failed.push((descriptor, e)),
            },
            Err(e) => outcome.failed.push((descriptor, e)),
        }
    }
    Ok(outcome)
}

/// Verifies a single sstable against the given options.
pub fn verify_sstable(sstable: &Arc<SSTableReader>, options: &VerifyOptions) -> Result<()> {
    let descriptor = sstable.descriptor();

    if options.check_version && descriptor.format() != SSTableFormat::LATEST {
        return Err(Error::Corruption(format!(
            "{descriptor} is on format {}, latest is {}",
            descriptor.format(),
            SSTableFormat::LATEST
        )));
    }

    if !options.token_ranges.is_empty() {
        for token in [sstable.first(), sstable.last()] {
            if !owned(&options.token_ranges, token) {
                return Err(Error::Corruption(format!(
                    "{descriptor} covers token {token} outside the owned ranges"
                )));
            }
        }
    }

    if !options.quick {
        read_fully(&descriptor.file_for(Component::Data))?;
        if options.extended {
            for component in sstable.components() {
                if *component != Component::Data {
                    read_fully(&descriptor.file_for(*component))?;
                }
            }
        }
    }

    if options.mutate_repair_status {
        sstable.set_repaired(true);
    }
    Ok(())
}

fn owned(ranges: &[Range], token: Token) -> bool {
    ranges.iter().any(|r| r.contains(token))
}

fn read_fully(path: &Path) -> Result<()> {
    let mut file = File::open(path)
        .map_err(|e| Error::Corruption(format!("cannot open {}: {e}", path.display())))?;
    io::copy(&mut file, &mut io::sink())
        .map_err(|e| Error::Corruption(format!("cannot read {}: {e}", path.display())))?;
    Ok(())
}
