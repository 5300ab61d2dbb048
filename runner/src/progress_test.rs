use crate::{
    checkpoint::Checkpoint,
    progress::{measure, Progress},
    unit::Layout,
};
use std::fs;
use tempfile::tempdir;

#[test]
pub fn counts_disk_and_checkpoint_evidence() {
    let dir = tempdir().unwrap();
    let layout = Layout::new(
        dir.path(),
        "dsgdb9nsd",
        6,
        "631gs",
        ["mp2", "ccsd", "ccsdt"].map(String::from).to_vec(),
    );

    // two outputs on disk
    for unit in [layout.unit(1, "mp2"), layout.unit(2, "ccsdt")] {
        fs::create_dir_all(layout.molecule_dir(unit.molecule_id())).unwrap();
        fs::write(layout.output_path(&unit), "").unwrap();
    }

    // one recorded, one recorded as not done, one outside the range
    let mut checkpoint = Checkpoint::new();
    checkpoint.entry("3".to_owned()).or_default().insert("ccsd".to_owned(), true);
    checkpoint.entry("3".to_owned()).or_default().insert("mp2".to_owned(), false);
    checkpoint.entry("9".to_owned()).or_default().insert("mp2".to_owned(), true);

    let progress = measure(&layout, &(1..=4), &checkpoint);

    assert_eq!(progress, Progress { done: 3, total: 12 });
    assert_eq!(progress.to_string(), "3/12 tasks done (25.0%)");
}

#[test]
pub fn nothing_done() {
    let dir = tempdir().unwrap();
    let layout = Layout::new(dir.path(), "mol", 3, "sto3g", vec!["hf".to_owned()]);

    let progress = measure(&layout, &(100..=199), &Checkpoint::new());

    assert_eq!(progress.total, 100);
    assert_eq!(progress.done, 0);
    assert_eq!(progress.percent(), 0.0);
}

#[test]
pub fn empty_total_counts_as_finished() {
    assert_eq!(Progress { done: 0, total: 0 }.percent(), 100.0);
}
