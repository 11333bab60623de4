//! SSTable identity and the on-disk filename grammar.
//!
//! An sstable lives in a table directory `<data>/<ks>/<cf>-<id>/` (with peer
//! subdirectories `backups/` and `snapshots/<name>/`) and each of its
//! component files is named `<generation>-<format>-<component>.db`. The
//! parser round-trips descriptor -> filename -> descriptor exactly and
//! rejects anything else.

use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::error::{Error, Result};

/// Subdirectory holding incremental-backup hard links.
pub const BACKUPS_SUBDIR: &str = "backups";
/// Subdirectory holding named snapshots.
pub const SNAPSHOTS_SUBDIR: &str = "snapshots";

/// One file of an sstable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    Data,
    Index,
    Summary,
    Filter,
    Statistics,
    CompressionInfo,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Data,
        Component::Index,
        Component::Summary,
        Component::Filter,
        Component::Statistics,
        Component::CompressionInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Data => "Data",
            Component::Index => "Index",
            Component::Summary => "Summary",
            Component::Filter => "Filter",
            Component::Statistics => "Statistics",
            Component::CompressionInfo => "CompressionInfo",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Component::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown sstable component: {s}")))
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk sstable format tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SSTableFormat {
    Big,
    Bti,
}

impl SSTableFormat {
    /// The format newly written sstables carry.
    pub const LATEST: SSTableFormat = SSTableFormat::Bti;

    pub fn as_str(&self) -> &'static str {
        match self {
            SSTableFormat::Big => "big",
            SSTableFormat::Bti => "bti",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "big" => Ok(SSTableFormat::Big),
            "bti" => Ok(SSTableFormat::Bti),
            other => Err(Error::InvalidInput(format!("unknown sstable format: {other}"))),
        }
    }
}

impl Display for SSTableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of an sstable: directory, keyspace, table, generation and format.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    directory: PathBuf,
    keyspace: String,
    table: String,
    generation: u64,
    format: SSTableFormat,
}

impl Descriptor {
    pub fn new(
        directory: impl Into<PathBuf>,
        keyspace: impl Into<String>,
        table: impl Into<String>,
        generation: u64,
        format: SSTableFormat,
    ) -> Self {
        Self {
            directory: absolutize(directory.into()),
            keyspace: keyspace.into(),
            table: table.into(),
            generation,
            format,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn format(&self) -> SSTableFormat {
        self.format
    }

    /// `<generation>-<format>-<component>.db`
    pub fn filename(&self, component: Component) -> String {
        format!("{}-{}-{}.db", self.generation, self.format, component)
    }

    pub fn file_for(&self, component: Component) -> PathBuf {
        self.directory.join(self.filename(component))
    }

    /// Parse a component file path back into its descriptor. The keyspace and
    /// table are derived from the directory layout, looking through `backups/`
    /// and `snapshots/<name>/` and accepting legacy `<ks>/<cf>` directories
    /// without an id suffix.
    pub fn from_file(path: &Path) -> Result<(Descriptor, Component)> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("not an sstable path: {}", path.display())))?;
        let (generation, format, component) = parse_filename(name)?;

        let directory = match path.parent() {
            Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
            Some(p) => p.to_path_buf(),
            None => PathBuf::from("."),
        };
        let (keyspace, table) = keyspace_and_table(&directory)?;

        Ok((
            Descriptor {
                directory: absolutize(directory),
                keyspace,
                table,
                generation,
                format,
            },
            component,
        ))
    }

    /// True iff `name` matches the component-file grammar.
    pub fn valid_filename(name: &str) -> bool {
        parse_filename(name).is_ok()
    }
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{}-{}-{}",
            self.keyspace, self.table, self.generation, self.format
        )
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

fn parse_filename(name: &str) -> Result<(u64, SSTableFormat, Component)> {
    let reject = || Error::InvalidInput(format!("invalid sstable filename: {name}"));

    let stem = name.strip_suffix(".db").ok_or_else(reject)?;
    let mut parts = stem.split('-');
    let (gen, fmt, comp) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(g), Some(f), Some(c), None) => (g, f, c),
        _ => return Err(reject()),
    };
    let generation: u64 = gen.parse().map_err(|_| reject())?;
    let format = SSTableFormat::parse(fmt).map_err(|_| reject())?;
    let component = Component::parse(comp).map_err(|_| reject())?;
    Ok((generation, format, component))
}

/// Walks up from an sstable's directory to its `<ks>/<cf>-<id>` location.
fn keyspace_and_table(directory: &Path) -> Result<(String, String)> {
    let unplaceable =
        || Error::InvalidInput(format!("cannot place directory {}", directory.display()));

    let dir_name = |p: &Path| -> Option<String> {
        p.file_name().and_then(|n| n.to_str()).map(str::to_owned)
    };

    let name = dir_name(directory).ok_or_else(unplaceable)?;
    let table_dir = if name == BACKUPS_SUBDIR {
        directory.parent().ok_or_else(unplaceable)?.to_path_buf()
    } else if directory
        .parent()
        .and_then(|p| dir_name(p))
        .map_or(false, |n| n == SNAPSHOTS_SUBDIR)
    {
        directory
            .parent()
            .and_then(Path::parent)
            .ok_or_else(unplaceable)?
            .to_path_buf()
    } else {
        directory.to_path_buf()
    };

    let table_name = dir_name(&table_dir).ok_or_else(unplaceable)?;
    let keyspace = table_dir
        .parent()
        .and_then(|p| dir_name(p))
        .ok_or_else(unplaceable)?;

    // "<cf>-<hexid>", or a bare "<cf>" in legacy layouts
    let table = match table_name.rsplit_once('-') {
        Some((cf, id)) if !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()) => {
            cf.to_owned()
        }
        _ => table_name,
    };

    Ok((keyspace, table))
}

/// Scans a table directory for complete-looking sstables, grouping component
/// files by descriptor. Files that do not match the grammar are skipped.
pub fn sstable_lister(table_dir: &Path) -> Result<Vec<(Descriptor, Vec<Component>)>> {
    let mut grouped: HashMap<Descriptor, Vec<Component>> = HashMap::new();
    for entry in fs::read_dir(table_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match Descriptor::from_file(&entry.path()) {
            Ok((descriptor, component)) => grouped.entry(descriptor).or_default().push(component),
            Err(_) => {
                tracing::trace!(file = %entry.path().display(), "skipping non-sstable file");
            }
        }
    }
    Ok(grouped
        .into_iter()
        .sorted_by_key(|(d, _)| d.generation())
        .collect())
}
