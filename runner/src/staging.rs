use crate::binding::RANKFILE_GLOB;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to copy {from:?} to {to:?}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to move {from:?} to {to:?}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to access staged files")]
    Io(#[from] std::io::Error),
    #[error("Invalid artifact glob")]
    Glob(#[from] globset::Error),
}

/// Copy `source` into `dir` under its own name, overwriting what a previous attempt left behind
pub fn stage_input(source: &Path, dir: &Path) -> Result<PathBuf, StagingError> {
    let target = dir.join(source.file_name().unwrap_or(source.as_os_str()));

    copy(source, &target)?;

    Ok(target)
}

/// Drop every `%pal` line and put a single `%pal nprocs <n> end` on top, all other lines keep
/// their order and line endings
pub fn patch_parallelism(content: &str, nprocs: usize) -> String {
    let mut patched = format!("%pal nprocs {nprocs} end\n");

    content
        .split_inclusive('\n')
        .filter(|line| !line.to_lowercase().contains("%pal"))
        .for_each(|line| patched.push_str(line));

    patched
}

pub fn patch_file(path: &Path, nprocs: usize) -> Result<(), StagingError> {
    let content = fs::read_to_string(path)?;

    fs::write(path, patch_parallelism(&content, nprocs))?;

    Ok(())
}

fn escape_glob(literal: &str) -> String {
    literal
        .chars()
        .map(|character| match character {
            '*' | '?' | '[' | ']' | '{' | '}' | '\\' => format!("\\{character}"),
            other => other.to_string(),
        })
        .collect()
}

/// Matches every artifact of one job, i.e., every file starting with its basename
#[derive(Debug)]
pub struct ArtifactMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl ArtifactMatcher {
    pub fn new(basename: &str) -> Result<Self, StagingError> {
        let include = GlobSetBuilder::new()
            .add(
                GlobBuilder::new(&format!("{}*", escape_glob(basename)))
                    .backslash_escape(true)
                    .build()?,
            )
            .build()?;
        let exclude = GlobSetBuilder::new().add(Glob::new(RANKFILE_GLOB)?).build()?;

        Ok(Self { include, exclude })
    }

    pub fn is_match(&self, file_name: &Path) -> bool {
        self.include.is_match(file_name) && !self.exclude.is_match(file_name)
    }

    /// Staged files of the job in `dir`, sorted for stable logs
    pub fn collect(&self, dir: &Path) -> Result<Vec<PathBuf>, StagingError> {
        let mut files = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;

            if entry.file_type()?.is_file() && self.is_match(Path::new(&entry.file_name())) {
                files.push(entry.path());
            }
        }

        files.sort();

        Ok(files)
    }
}

fn copy(from: &Path, to: &Path) -> Result<(), StagingError> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| StagingError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

/// Copy `file` into `dir`, the original stays where it is
pub fn copy_into(file: &Path, dir: &Path) -> Result<PathBuf, StagingError> {
    let target = dir.join(file.file_name().unwrap_or(file.as_os_str()));

    copy(file, &target)?;
    debug!(from = ?file, to = ?target, "Copied artifact");

    Ok(target)
}

/// Move `file` into `dir`. Scratch and permanent storage usually live on different file
/// systems, so a failed rename falls back to copy and remove.
pub fn move_into(file: &Path, dir: &Path) -> Result<PathBuf, StagingError> {
    let target = dir.join(file.file_name().unwrap_or(file.as_os_str()));

    match fs::rename(file, &target) {
        Ok(()) => {}
        Err(error) if error.kind() != ErrorKind::NotFound => {
            debug!(error = ?error, from = ?file, "Rename failed, falling back to copy");

            copy(file, &target)?;
            fs::remove_file(file).map_err(|source| StagingError::Move {
                from: file.to_path_buf(),
                to: target.clone(),
                source,
            })?;
        }
        Err(source) => {
            return Err(StagingError::Move {
                from: file.to_path_buf(),
                to: target,
                source,
            })
        }
    }

    debug!(from = ?file, to = ?target, "Moved artifact");

    Ok(target)
}
