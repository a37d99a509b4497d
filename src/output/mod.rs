use std::path::{Path, PathBuf};

use anyhow::Context;
use fxhash::FxHashSet;
use tracing::{debug, info, warn};

use crate::record::JobRecord;


/// Where the rows of the current run go relative to the rows already in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// After the existing rows, in discovery order.
    Tail,
    /// Ahead of the existing rows, still in discovery order among themselves.
    ///
    /// Used when the existing rows are an older newest-first listing and the new rows
    /// were found above them.
    Head
}


/// The destination CSV file, kept fully in memory and rewritten on every append.
pub(crate) struct OutputStore {
    path: PathBuf,
    placement: Placement,
    existing: Vec<JobRecord>,
    added: Vec<JobRecord>,
    appends: u64
}


impl OutputStore {
    /// Opens `path`, treating the first `added` rows of a [`Placement::Head`] file as
    /// rows a previous attempt of this run already wrote.
    pub(crate) fn open(path: impl Into<PathBuf>, placement: Placement, added: usize) -> anyhow::Result<Self> {
        let path = path.into();
        let mut rows = if path.exists() { read_records(&path)? } else { Vec::new() };

        let (existing, added) = match placement {
            Placement::Tail => (rows, Vec::new()),
            Placement::Head => {
                let existing = rows.split_off(added.min(rows.len()));
                (existing, rows)
            }
        };
        info!(path = %path.display(), rows = existing.len() + added.len(), "Opened output file");
        Ok(Self { path, placement, existing, added, appends: 0 })
    }

    /// Starts a store whose existing rows come from somewhere other than `path`.
    pub(crate) fn seeded(path: impl Into<PathBuf>, placement: Placement, existing: Vec<JobRecord>) -> Self {
        Self { path: path.into(), placement, existing, added: Vec::new(), appends: 0 }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Rows that were present before this run, in file order.
    pub(crate) fn existing(&self) -> &[JobRecord] {
        &self.existing
    }

    pub(crate) fn len(&self) -> usize {
        self.existing.len() + self.added.len()
    }

    pub(crate) fn appends(&self) -> u64 {
        self.appends
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &JobRecord> {
        let (first, second) = match self.placement {
            Placement::Tail => (&self.existing, &self.added),
            Placement::Head => (&self.added, &self.existing)
        };
        first.iter().chain(second.iter())
    }

    pub(crate) fn known_links(&self) -> FxHashSet<String> {
        self.rows().map(|r| r.link.clone()).collect()
    }

    /// Writes the file with just a header if it does not exist yet.
    pub(crate) fn ensure_file(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.write_all()
    }

    /// Adds `records` and rewrites the whole file.
    ///
    /// On error the records stay in memory and go out with the next successful write.
    pub(crate) fn append(&mut self, records: Vec<JobRecord>) -> anyhow::Result<()> {
        let before = self.added.len();
        self.added.extend(records.into_iter().filter(|r| {
            if r.link.is_empty() {
                warn!("Dropping a record without a link");
                false
            } else {
                true
            }
        }));
        if self.added.len() == before {
            return Ok(());
        }
        self.appends += 1;
        self.write_all()?;
        debug!(total = self.len(), "Output file rewritten");
        Ok(())
    }

    /// Copies the live file to a file in `dir` named by time and append count.
    pub(crate) fn snapshot(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let target = dir.join(format!("backup_{stamp}_{}.csv", self.appends));
        std::fs::copy(&self.path, &target)
            .with_context(|| format!("Failed to copy {} to {}", self.path.display(), target.display()))?;
        info!(backup = %target.display(), "Backup written");
        Ok(target)
    }

    fn write_all(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}. Do we have permissions?", parent.display()))?;
        }

        let tmp = self.path.with_extension("csv.tmp");
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        writer.write_record(JobRecord::HEADERS)?;
        for record in self.rows() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        drop(writer);

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}


/// Reads every row of an output-format CSV file.
pub(crate) fn read_records(path: &Path) -> anyhow::Result<Vec<JobRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("Row {} of {} is malformed", i + 2, path.display())))
        .collect()
}


/// Reads the listing links to visit from an input CSV file.
///
/// Takes the column whose header equals `column`, or the last cell of each row when no
/// column is named. Blank cells are skipped.
pub(crate) fn read_links(path: &Path, column: Option<&str>) -> anyhow::Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input file {}", path.display()))?;

    let index = match column {
        Some(name) => {
            let headers = reader.headers()?;
            let index = headers.iter().position(|h| h.trim() == name.trim());
            Some(index.with_context(|| format!("Input file {} has no column named {name:?}", path.display()))?)
        }
        None => None
    };

    let mut links = Vec::new();
    for row in reader.records() {
        let row = row?;
        let cell = match index {
            Some(i) => row.get(i),
            None => row.iter().last()
        };
        if let Some(link) = cell.map(str::trim).filter(|c| !c.is_empty()) {
            links.push(link.to_string());
        }
    }
    Ok(links)
}
