use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};


/// Progress of one run, written after every unit of work.
#[derive(Debug, Clone, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub(crate) struct Checkpoint {
    /// Next unit to process: a row index or a page number depending on the mode.
    pub(crate) cursor: u64,
    pub(crate) destination: String,
    pub(crate) input: Option<String>,
    /// Site and mode the checkpoint was written by, e.g. `jobinja/new-only`.
    pub(crate) mode: String,
    pub(crate) consecutive_duplicates: u32,
    /// Records this run has put in the output so far.
    pub(crate) records_added: u64,
    /// Unix seconds.
    pub(crate) saved_at: i64
}


impl Checkpoint {
    pub(crate) fn new(destination: &Path, input: Option<&Path>, mode: impl Into<String>) -> Self {
        Self {
            cursor: 0,
            destination: destination.to_string_lossy().into_owned(),
            input: input.map(|p| p.to_string_lossy().into_owned()),
            mode: mode.into(),
            consecutive_duplicates: 0,
            records_added: 0,
            saved_at: 0
        }
    }

    fn same_run(&self, other: &Checkpoint) -> Result<(), &'static str> {
        if self.destination != other.destination {
            return Err("destination changed");
        }
        if self.input != other.input {
            return Err("input changed");
        }
        if self.mode != other.mode {
            return Err("mode changed");
        }
        Ok(())
    }
}


pub(crate) struct CheckpointStore {
    path: PathBuf
}


impl CheckpointStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint file. A missing or unreadable file yields `None`.
    pub(crate) fn load(&self) -> Option<Checkpoint> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read checkpoint");
                return None;
            }
        };
        match bitcode::decode::<Checkpoint>(&bytes) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Checkpoint is corrupt, starting fresh");
                None
            }
        }
    }

    /// Returns the stored checkpoint if it was written by the same run as `expected`
    /// and its destination file is still there.
    pub(crate) fn resume_point(&self, expected: &Checkpoint) -> Option<Checkpoint> {
        let stored = self.load()?;
        if let Err(reason) = stored.same_run(expected) {
            info!(reason, "Ignoring checkpoint from a different run");
            return None;
        }
        if !Path::new(&stored.destination).exists() {
            info!(destination = %stored.destination, "Ignoring checkpoint, destination file is gone");
            return None;
        }
        Some(stored)
    }

    pub(crate) fn save(&self, checkpoint: &mut Checkpoint) -> anyhow::Result<()> {
        checkpoint.saved_at = chrono::Utc::now().timestamp();
        let bytes = bitcode::encode(&*checkpoint).context("Failed to encode checkpoint")?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write checkpoint to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move checkpoint into {}", self.path.display()))?;
        debug!(cursor = checkpoint.cursor, "Checkpoint saved");
        Ok(())
    }

    pub(crate) fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete checkpoint {}", self.path.display()))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;

    #[test]
    fn saving_then_loading_keeps_the_cursor() {
        let dir = scratch_dir("checkpoint-roundtrip");
        let destination = dir.join("jobs.csv");
        std::fs::write(&destination, "Title\n").unwrap();

        let store = CheckpointStore::new(dir.join("run.checkpoint"));
        let mut checkpoint = Checkpoint::new(&destination, None, "jobinja/all-pages");
        checkpoint.cursor = 17;
        store.save(&mut checkpoint).unwrap();

        let expected = Checkpoint::new(&destination, None, "jobinja/all-pages");
        let resumed = store.resume_point(&expected).unwrap();
        assert_eq!(resumed.cursor, 17);
        assert_eq!(resumed, checkpoint);
    }

    #[test]
    fn a_different_destination_starts_over() {
        let dir = scratch_dir("checkpoint-mismatch");
        let destination = dir.join("jobs.csv");
        std::fs::write(&destination, "Title\n").unwrap();

        let store = CheckpointStore::new(dir.join("run.checkpoint"));
        let mut checkpoint = Checkpoint::new(&destination, None, "jobinja/all-pages");
        checkpoint.cursor = 3;
        store.save(&mut checkpoint).unwrap();

        let other = Checkpoint::new(&dir.join("other.csv"), None, "jobinja/all-pages");
        assert!(store.resume_point(&other).is_none());
        let other_mode = Checkpoint::new(&destination, None, "jobvision/all-pages");
        assert!(store.resume_point(&other_mode).is_none());
    }

    #[test]
    fn missing_destination_file_invalidates_the_checkpoint() {
        let dir = scratch_dir("checkpoint-missing-dest");
        let destination = dir.join("gone.csv");
        let store = CheckpointStore::new(dir.join("run.checkpoint"));
        let mut checkpoint = Checkpoint::new(&destination, None, "jobinja/url-list");
        store.save(&mut checkpoint).unwrap();

        assert!(store.load().is_some());
        assert!(store.resume_point(&checkpoint).is_none());
    }

    #[test]
    fn garbage_and_cleared_checkpoints_read_as_absent() {
        let dir = scratch_dir("checkpoint-garbage");
        let store = CheckpointStore::new(dir.join("run.checkpoint"));
        std::fs::write(store.path(), b"x").unwrap();
        assert!(store.load().is_none());

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }
}
