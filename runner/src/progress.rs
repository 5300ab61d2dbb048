use crate::{
    checkpoint::{is_completed, Checkpoint},
    unit::Layout,
};
use rayon::prelude::*;
use std::{fmt, ops::RangeInclusive};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.done as f64 / self.total as f64 * 100.0
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tasks done ({:.1}%)",
            self.done,
            self.total,
            self.percent()
        )
    }
}

/// Count completed units of an id range. Read-only, the file checks run in parallel since
/// the source root usually sits on a network file system.
pub fn measure(layout: &Layout, ids: &RangeInclusive<u64>, checkpoint: &Checkpoint) -> Progress {
    let done = ids
        .clone()
        .into_par_iter()
        .map(|id| {
            layout
                .methods()
                .iter()
                .filter(|method| is_completed(layout, &layout.unit(id, method), checkpoint))
                .count()
        })
        .sum();

    Progress {
        done,
        total: layout.unit_count(ids),
    }
}

pub fn report(layout: &Layout, ids: &RangeInclusive<u64>, checkpoint: &Checkpoint) -> Progress {
    let progress = measure(layout, ids, checkpoint);

    info!("Progress: {progress}");

    progress
}
