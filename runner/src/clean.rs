use std::{
    fmt, fs,
    io::{self, BufRead, IsTerminal, Write},
    path::Path,
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted: usize,
    pub errors: usize,
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deleted: {}, Errors: {}", self.deleted, self.errors)
    }
}

/// Entries directly below `dir`, None if the directory does not exist
pub fn entries(dir: &Path) -> io::Result<Option<Vec<fs::DirEntry>>> {
    match fs::read_dir(dir) {
        Ok(read_dir) => Ok(Some(read_dir.collect::<io::Result<Vec<_>>>()?)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Delete every file and subdirectory of `dir`, the directory itself stays.
/// A failed entry is logged and counted, the rest are still attempted.
pub fn clean_dir(dir: &Path) -> io::Result<Option<CleanReport>> {
    let Some(entries) = entries(dir)? else {
        return Ok(None);
    };

    let mut report = CleanReport::default();

    for entry in entries {
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => report.deleted += 1,
            Err(error) => {
                error!(path = ?path, error = ?error, "Failed to delete");
                report.errors += 1;
            }
        }
    }

    Ok(Some(report))
}

/// Parse a y/N answer, anything but `y` declines
pub fn confirmed(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

fn ask(count: usize) -> io::Result<bool> {
    print!("Found {count} files/directories to delete. Are you sure you want to delete them? (y/N): ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    Ok(confirmed(&answer))
}

/// `clean` command: wipe the scratch directory, asking first on a terminal unless `assume_yes`
pub fn run(dir: &Path, assume_yes: bool) -> io::Result<Option<CleanReport>> {
    warn!("This deletes ALL files in the scratch directory, running it next to an active batch makes its jobs fail");
    info!("Cleaning scratch directory {}", dir.to_string_lossy());

    let count = match entries(dir)? {
        None => {
            info!("Directory does not exist.");
            return Ok(None);
        }
        Some(entries) if entries.is_empty() => {
            info!("Directory is already empty.");
            return Ok(Some(CleanReport::default()));
        }
        Some(entries) => entries.len(),
    };

    if !assume_yes && io::stdin().is_terminal() && !ask(count)? {
        info!("Operation cancelled.");
        return Ok(None);
    }

    let report = clean_dir(dir)?;

    if let Some(report) = report {
        info!("Cleanup complete. {report}");
    }

    Ok(report)
}
