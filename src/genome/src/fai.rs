use std::{
    collections::HashMap,
    fs,
    path::Path,
};

use ahash::RandomState;
use located_error::prelude::*;
use thiserror::Error;

/// One record of a samtools-style `.fai` index: `name  len  offset  linebases  linewidth`.
/// Only `name` and `length` matter to the assembler; offset/linebases/linewidth are
/// kept only to validate the file shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scaffold {
    pub name: String,
    pub length: u64,
}

#[derive(Error, Debug)]
pub enum FaiError {
    #[error("Failed to read fasta index file '{}'", path.display())]
    Io { path: std::path::PathBuf, #[source] source: std::io::Error },

    #[error("Malformed .fai line (expected 5 tab-separated fields): '{0}'")]
    MalformedLine(String),

    #[error("Duplicate scaffold name '{0}' in .fai index")]
    DuplicateScaffold(String),
}

/// In-memory index over a reference fasta's `.fai` sidecar file.
///
/// Scaffold ids are assigned in file order, starting at 1 (id 0 is reserved
/// to mean "no reference", matching the rest of the pipeline's convention of
/// treating `scaffold_id == 0` as the denovo/unplaced locus).
#[derive(Debug, Clone, Default)]
pub struct FaiIndex {
    scaffolds: Vec<Scaffold>,
    by_name: HashMap<String, u32, RandomState>,
}

impl FaiIndex {
    /// Parse a `.fai` file on disk.
    ///
    /// # Errors
    /// Returns [`FaiError`] if the file cannot be read, or if any line does
    /// not have the expected 5 tab-separated fields, or on duplicate names.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| FaiError::Io { path: path.to_path_buf(), source })
            .with_loc(|| format!("While reading fasta index '{}'", path.display()))?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> anyhow::Result<Self> {
        let mut scaffolds = Vec::new();
        let mut by_name = HashMap::default();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 2 {
                return Err(FaiError::MalformedLine(line.to_string())).loc("While parsing .fai index");
            }
            let name = fields[0].to_string();
            let length: u64 = fields[1]
                .parse()
                .map_err(|_| FaiError::MalformedLine(line.to_string()))
                .loc("While parsing .fai scaffold length")?;
            let id = u32::try_from(scaffolds.len() + 1).expect("scaffold count overflow");
            if by_name.insert(name.clone(), id).is_some() {
                return Err(FaiError::DuplicateScaffold(name)).loc("While indexing .fai scaffolds");
            }
            scaffolds.push(Scaffold { name, length });
        }
        Ok(Self { scaffolds, by_name })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scaffolds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scaffolds.is_empty()
    }

    /// 1-indexed scaffold id for a given scaffold name, if present.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn scaffold(&self, id: u32) -> Option<&Scaffold> {
        id.checked_sub(1).and_then(|i| self.scaffolds.get(i as usize))
    }

    #[must_use]
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.scaffold(id).map(|s| s.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Scaffold)> {
        self.scaffolds.iter().enumerate().map(|(i, s)| (i as u32 + 1, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_fai() {
        let fai = FaiIndex::parse("scaffold_1\t1000\t12\t70\t71\nscaffold_2\t500\t1100\t70\t71\n").unwrap();
        assert_eq!(fai.len(), 2);
        assert_eq!(fai.id_of("scaffold_1"), Some(1));
        assert_eq!(fai.id_of("scaffold_2"), Some(2));
        assert_eq!(fai.name_of(1), Some("scaffold_1"));
        assert_eq!(fai.scaffold(2).unwrap().length, 500);
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = FaiIndex::parse("a\t10\t0\t10\t11\na\t20\t20\t10\t11\n");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(FaiIndex::parse("only_one_field\n").is_err());
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.fa.fai");
        fs::write(&path, "scaf\t42\t0\t42\t43\n").unwrap();
        let fai = FaiIndex::from_path(&path).unwrap();
        assert_eq!(fai.id_of("scaf"), Some(1));
    }
}
