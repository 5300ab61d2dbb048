use crate::unit::{Layout, WorkUnit};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// molecule id -> method -> completed
pub type Checkpoint = BTreeMap<String, BTreeMap<String, bool>>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Checkpoint {path:?} is corrupt, refusing to start over from scratch")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write checkpoint")]
    Write(#[from] std::io::Error),
    #[error("Failed to serialize checkpoint")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to replace checkpoint file")]
    Persist(#[from] tempfile::PersistError),
}

/// Read the checkpoint at `path`, a missing file is an empty checkpoint
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(path = ?path, "No checkpoint yet, starting empty");

            return Ok(Checkpoint::new());
        }
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_reader(BufReader::new(file)).map_err(|source| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the whole checkpoint next to `path` and rename it into place,
/// readers see either the old or the new file
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temporary = NamedTempFile::new_in(dir)?;

    {
        let mut writer = BufWriter::new(temporary.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, checkpoint)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    // temp files are created 0600, keep whatever mode the checkpoint had before
    match fs::metadata(path) {
        Ok(metadata) => temporary.as_file().set_permissions(metadata.permissions())?,
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    temporary.as_file().sync_all()?;
    temporary.persist(path)?;

    Ok(())
}

pub fn is_recorded(checkpoint: &Checkpoint, unit: &WorkUnit) -> bool {
    checkpoint
        .get(&unit.molecule_id().to_string())
        .and_then(|methods| methods.get(unit.method()))
        .copied()
        .unwrap_or(false)
}

/// A unit is done if its output sits in the molecule directory, or else if the checkpoint says so
pub fn is_completed(layout: &Layout, unit: &WorkUnit, checkpoint: &Checkpoint) -> bool {
    layout.output_path(unit).is_file() || is_recorded(checkpoint, unit)
}

/// Single owner of the checkpoint file for a batch.
/// Workers only go through `mark_completed`, which updates and persists under one lock.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<Checkpoint>,
}

impl CheckpointStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = load(&path)?;

        info!(
            path = ?path,
            molecules = state.len(),
            "Loaded checkpoint"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.state.lock().clone()
    }

    pub fn is_completed(&self, layout: &Layout, unit: &WorkUnit) -> bool {
        layout.output_path(unit).is_file() || is_recorded(&self.state.lock(), unit)
    }

    /// Record `unit` as done and persist. A failed save is retried once, the entry stays in
    /// memory either way so the next successful save still carries it.
    pub fn mark_completed(&self, unit: &WorkUnit) -> Result<(), CheckpointError> {
        let mut state = self.state.lock();

        state
            .entry(unit.molecule_id().to_string())
            .or_default()
            .insert(unit.method().to_owned(), true);

        if let Err(error) = save(&self.path, &state) {
            warn!(error = ?error, path = ?self.path, "Failed to save checkpoint, retrying once");

            if let Err(error) = save(&self.path, &state) {
                error!(error = ?error, path = ?self.path, "Checkpoint could not be saved");

                return Err(error);
            }
        }

        Ok(())
    }
}
