use crate::unit::Layout;
use itertools::Itertools;

fn layout() -> Layout {
    Layout::new(
        "/data/source",
        "dsgdb9nsd",
        6,
        "631gs",
        ["mp2", "ccsd", "ccsdt"].map(String::from).to_vec(),
    )
}

#[test]
pub fn file_names_follow_the_dataset_scheme() {
    let unit = layout().unit(53, "ccsd");

    assert_eq!(unit.basename(), "dsgdb9nsd_000053_ccsd_631gs");
    assert_eq!(unit.input_name(), "dsgdb9nsd_000053_ccsd_631gs.inp");
    assert_eq!(unit.output_name(), "dsgdb9nsd_000053_ccsd_631gs.out");
    assert_eq!(unit.file_name("gbw"), "dsgdb9nsd_000053_ccsd_631gs.gbw");
    assert_eq!(unit.to_string(), unit.basename());
}

#[test]
pub fn paths_point_into_the_molecule_directory() {
    let layout = layout();
    let unit = layout.unit(7, "mp2");

    assert_eq!(
        layout.input_path(&unit).to_str(),
        Some("/data/source/dsgdb9nsd_000007/dsgdb9nsd_000007_mp2_631gs.inp")
    );
    assert_eq!(
        layout.output_path(&unit).to_str(),
        Some("/data/source/dsgdb9nsd_000007/dsgdb9nsd_000007_mp2_631gs.out")
    );
}

#[test]
pub fn ids_wider_than_the_padding_are_kept_whole() {
    assert_eq!(
        layout().unit(1_234_567, "mp2").basename(),
        "dsgdb9nsd_1234567_mp2_631gs"
    );
}

#[test]
pub fn enumeration_is_id_major() {
    let layout = layout();
    let order = layout
        .units(10..=11)
        .map(|unit| (unit.molecule_id(), unit.method().to_owned()))
        .collect_vec();

    assert_eq!(
        order,
        vec![
            (10, "mp2".to_owned()),
            (10, "ccsd".to_owned()),
            (10, "ccsdt".to_owned()),
            (11, "mp2".to_owned()),
            (11, "ccsd".to_owned()),
            (11, "ccsdt".to_owned()),
        ]
    );
    assert_eq!(layout.unit_count(&(10..=11)), 6);
}

#[test]
pub fn enumeration_is_stable() {
    let layout = layout();

    assert_eq!(
        layout.units(1..=5).collect_vec(),
        layout.units(1..=5).collect_vec()
    );
}
