use std::{fs, io, path::Path};

/// Substrings that mark a run as broken, matched case-insensitively
pub const DEFAULT_ERROR_PATTERNS: [&str; 9] = [
    "aborting the run",
    "Error termination",
    "The MDCI module",
    "mdci_state.cpp",
    "orca_mdci_mpi",
    "not enough slots",
    "illegal state",
    "Segmentation fault",
    "Signal: Aborted",
];

/// lines of output kept in an `.err` report
pub const TAIL_LINES: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMatch {
    pub pattern: String,
    pub tail: Vec<String>,
}

/// First pattern (in list order) found in `content`, with the last lines of output
pub fn scan(content: &str, patterns: &[String]) -> Option<ErrorMatch> {
    let lowered = content.to_lowercase();

    patterns
        .iter()
        .find(|pattern| !pattern.is_empty() && lowered.contains(&pattern.to_lowercase()))
        .map(|pattern| {
            let lines = content.lines().collect::<Vec<_>>();
            let skip = lines.len().saturating_sub(TAIL_LINES);

            ErrorMatch {
                pattern: pattern.clone(),
                tail: lines[skip..].iter().map(|line| line.to_string()).collect(),
            }
        })
}

/// Scan an output file, invalid UTF-8 is replaced rather than rejected
pub fn scan_file(path: &Path, patterns: &[String]) -> io::Result<Option<ErrorMatch>> {
    let bytes = fs::read(path)?;

    Ok(scan(&String::from_utf8_lossy(&bytes), patterns))
}

pub fn render_report(job: &str, date: &str, found: &ErrorMatch) -> String {
    let mut report = format!(
        "Job: {job}\nDate: {date}\nMatched Error: {}\n\nLast {TAIL_LINES} lines:\n",
        found.pattern
    );

    for line in &found.tail {
        report.push_str(line);
        report.push('\n');
    }

    report
}

/// Write the `.err` side file for manual triage
pub fn write_report(path: &Path, job: &str, found: &ErrorMatch) -> io::Result<()> {
    let date = chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string();

    fs::write(path, render_report(job, &date, found))
}
