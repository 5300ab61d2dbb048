use crate::config::BatchConfig;
use itertools::iproduct;
use std::{
    fmt,
    ops::RangeInclusive,
    path::PathBuf,
};

/// One (molecule, method) pair, i.e., one solver invocation.
/// The job basename is derived once on creation and never changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    molecule_id: u64,
    method: String,
    basename: String,
}

impl WorkUnit {
    pub fn molecule_id(&self) -> u64 {
        self.molecule_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `<prefix>_<padded id>_<method>_<basis>`, shared by every artifact of the job
    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{extension}", self.basename)
    }

    pub fn input_name(&self) -> String {
        self.file_name("inp")
    }

    pub fn output_name(&self) -> String {
        self.file_name("out")
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.basename)
    }
}

/// Naming scheme and directory layout of a dataset
#[derive(Clone, Debug)]
pub struct Layout {
    source_root: PathBuf,
    prefix: String,
    width: usize,
    basis: String,
    methods: Vec<String>,
}

impl Layout {
    pub fn new(
        source_root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        width: usize,
        basis: impl Into<String>,
        methods: Vec<String>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            prefix: prefix.into(),
            width,
            basis: basis.into(),
            methods,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(
            config.source_root.clone(),
            config.dataset_prefix.clone(),
            config.id_width,
            config.basis.clone(),
            config.methods.clone(),
        )
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn unit(&self, molecule_id: u64, method: &str) -> WorkUnit {
        WorkUnit {
            molecule_id,
            method: method.to_owned(),
            basename: format!(
                "{}_{:0width$}_{method}_{}",
                self.prefix,
                molecule_id,
                self.basis,
                width = self.width
            ),
        }
    }

    pub fn molecule_name(&self, molecule_id: u64) -> String {
        format!("{}_{:0width$}", self.prefix, molecule_id, width = self.width)
    }

    /// permanent per-molecule directory
    pub fn molecule_dir(&self, molecule_id: u64) -> PathBuf {
        self.source_root.join(self.molecule_name(molecule_id))
    }

    pub fn input_path(&self, unit: &WorkUnit) -> PathBuf {
        self.molecule_dir(unit.molecule_id).join(unit.input_name())
    }

    /// canonical output location, its presence means the unit is done
    pub fn output_path(&self, unit: &WorkUnit) -> PathBuf {
        self.molecule_dir(unit.molecule_id).join(unit.output_name())
    }

    /// Every unit of an id range, id-major: all methods of molecule n (in configured order)
    /// before any of molecule n + 1.
    pub fn units(&self, ids: RangeInclusive<u64>) -> impl Iterator<Item = WorkUnit> + '_ {
        iproduct!(ids, self.methods.iter()).map(move |(id, method)| self.unit(id, method))
    }

    pub fn unit_count(&self, ids: &RangeInclusive<u64>) -> usize {
        if ids.is_empty() {
            0
        } else {
            (ids.end() - ids.start() + 1) as usize * self.methods.len()
        }
    }
}
