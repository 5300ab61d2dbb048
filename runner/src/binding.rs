use crate::config::ConfigErrors;
use once_cell::sync::Lazy;
use std::{
    fmt,
    fs::{self, File},
    io::{BufWriter, Write},
    ops::Deref,
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};

/// Inclusive range of core ids
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreRange {
    pub start: usize,
    pub end: usize,
}

impl CoreRange {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// true if the range covers cores of more than one socket
    pub fn crosses_socket(&self, cores_per_socket: usize) -> bool {
        cores_per_socket > 0 && self.start / cores_per_socket != self.end / cores_per_socket
    }

    pub fn cores(&self) -> Vec<usize> {
        (self.start..=self.end).collect()
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub ranges: Vec<CoreRange>,
    pub cores_per_slot: usize,
}

/// Split `[0, total_cores)` into `num_slots` contiguous ranges of `total_cores / num_slots`
/// cores each, the last range takes the remainder.
pub fn partition(total_cores: usize, num_slots: usize) -> Result<Partition, ConfigErrors> {
    if num_slots == 0 || num_slots > total_cores {
        return Err(ConfigErrors::InvalidPartition {
            cores: total_cores,
            slots: num_slots,
        });
    }

    let cores_per_slot = total_cores / num_slots;
    let ranges = (0..num_slots)
        .map(|index| CoreRange {
            start: index * cores_per_slot,
            end: if index == num_slots - 1 {
                total_cores - 1
            } else {
                (index + 1) * cores_per_slot - 1
            },
        })
        .collect();

    Ok(Partition {
        ranges,
        cores_per_slot,
    })
}

/// Core range and process count owned by one worker for a whole batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub range: CoreRange,
    pub nprocs: usize,
}

impl Partition {
    /// Slots whose core range spans a socket boundary. Their rankfile numbers every rank on the
    /// first socket, so core ids past `cores_per_socket` show up.
    pub fn crossing_slots(&self, cores_per_socket: usize) -> Vec<Slot> {
        self.slots()
            .into_iter()
            .filter(|slot| slot.range.crosses_socket(cores_per_socket))
            .collect()
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.ranges
            .iter()
            .enumerate()
            .map(|(index, range)| Slot {
                index,
                range: *range,
                nprocs: self.cores_per_slot,
            })
            .collect()
    }
}

/// hostname written into rankfiles, resolved once per process
pub static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) if !hostname.is_empty() => hostname.to_string_lossy().into_owned(),
    Ok(_) => String::from("localhost"),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve hostname for rankfile, using localhost");
        String::from("localhost")
    }
});

pub fn rankfile_name(slot_index: usize) -> String {
    format!("rankfile_slot{slot_index}.txt")
}

/// glob matching every rankfile name, used to keep them out of artifact relocation
pub const RANKFILE_GLOB: &str = "rankfile_slot*.txt";

/// One `rank <r>=<host> slot=<socket>:<core>` line per process. The socket is taken from the
/// first core of the range, cores are counted from that socket's first core.
pub fn rankfile_lines(
    range: CoreRange,
    nprocs: usize,
    hostname: &str,
    cores_per_socket: usize,
) -> String {
    let socket = range.start / cores_per_socket;
    let local_start = range.start % cores_per_socket;

    (0..nprocs)
        .map(|rank| format!("rank {rank}={hostname} slot={socket}:{}\n", local_start + rank))
        .collect()
}

/// A rankfile on disk that is removed again on drop.
#[derive(Debug)]
pub struct RankFile {
    path: PathBuf,
}

impl RankFile {
    pub fn create(dir: &Path, slot: &Slot, cores_per_socket: usize) -> Result<Self, std::io::Error> {
        let path = dir.join(rankfile_name(slot.index));
        let mut writer = BufWriter::new(File::create(&path)?);

        writer.write_all(
            rankfile_lines(slot.range, slot.nprocs, HOSTNAME.as_str(), cores_per_socket)
                .as_bytes(),
        )?;
        writer.flush()?;

        debug!(path = ?path, "Wrote rankfile for slot {}", slot.index);

        Ok(Self { path })
    }
}

impl Deref for RankFile {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl Drop for RankFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed rankfile"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to remove rankfile"),
        }
    }
}
