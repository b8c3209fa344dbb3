//! Barcode-table parsing for the demultiplex stage.

use std::{collections::HashMap, io::BufRead};

use located_error::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BarcodeError {
    #[error("barcode line has neither 2 nor 3 whitespace-separated fields: '{0}'")]
    MalformedLine(String),

    #[error("duplicate sample name '{0}' in barcode file")]
    DuplicateSample(String),

    #[error("barcode '{0}' contains a character outside ACGT/IUPAC ambiguity codes")]
    InvalidBase(String),
}

/// IUPAC ambiguity codes recognized in barcode sequences and their two
/// resolutions (distinct from [`genome::Base`]'s heterozygote codes, which
/// apply to basecalls rather than the degenerate-primer alphabet).
fn expand_ambiguous(code: char) -> Option<(char, char)> {
    match code.to_ascii_uppercase() {
        'R' => Some(('A', 'G')),
        'K' => Some(('G', 'T')),
        'S' => Some(('C', 'G')),
        'Y' => Some(('C', 'T')),
        'W' => Some(('A', 'T')),
        'M' => Some(('A', 'C')),
        _ => None,
    }
}

fn is_valid_barcode_char(c: char) -> bool {
    matches!(c.to_ascii_uppercase(), 'A' | 'C' | 'G' | 'T' | 'R' | 'K' | 'S' | 'Y' | 'W' | 'M')
}

/// Expand IUPAC ambiguity codes in a barcode into the set of concrete
/// sequences it could resolve to. Most barcodes have none and expand to a
/// singleton; each ambiguous position doubles the expansion set.
fn expand_barcode(barcode: &str) -> anyhow::Result<Vec<String>> {
    if !barcode.chars().all(is_valid_barcode_char) {
        return Err(BarcodeError::InvalidBase(barcode.to_string())).loc("While validating a barcode");
    }
    let mut candidates = vec![String::new()];
    for c in barcode.chars().map(|c| c.to_ascii_uppercase()) {
        candidates = match expand_ambiguous(c) {
            Some((a, b)) => candidates
                .iter()
                .flat_map(|prefix| [format!("{prefix}{a}"), format!("{prefix}{b}")])
                .collect(),
            None => candidates.into_iter().map(|prefix| format!("{prefix}{c}")).collect(),
        };
    }
    Ok(candidates)
}

/// A parsed barcode table: every resolved barcode sequence (1 or 2 per
/// sample, expanded from ambiguity codes) maps back to its sample name.
#[derive(Debug, Default, Clone)]
pub struct BarcodeTable {
    by_sequence: HashMap<String, String>,
}

impl BarcodeTable {
    /// Parse a whitespace-separated `sample barcode1 [barcode2]` table.
    ///
    /// # Errors
    /// [`BarcodeError`] on malformed lines, duplicate sample names, or
    /// barcode characters outside `ACGT` + `RKSYWM`.
    pub fn parse(source: impl BufRead) -> anyhow::Result<Self> {
        let mut by_sequence = HashMap::new();
        let mut seen_samples = std::collections::HashSet::new();
        for line in source.lines() {
            let line = line.loc("While reading barcode table")?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 && fields.len() != 3 {
                return Err(BarcodeError::MalformedLine(line.to_string())).loc("While parsing barcode table");
            }
            let sample = fields[0].to_string();
            if !seen_samples.insert(sample.clone()) {
                return Err(BarcodeError::DuplicateSample(sample)).loc("While parsing barcode table");
            }
            for barcode_field in &fields[1..] {
                for resolved in expand_barcode(&barcode_field.to_ascii_uppercase())? {
                    by_sequence.insert(resolved, sample.clone());
                }
            }
        }
        Ok(Self { by_sequence })
    }

    #[must_use]
    pub fn sample_for(&self, barcode: &str) -> Option<&str> {
        self.by_sequence.get(&barcode.to_ascii_uppercase()).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_sequence.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_sequence.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_simple_table() {
        let table = BarcodeTable::parse(Cursor::new("sampleA\tACGT\nsampleB\tTTTT\n")).unwrap();
        assert_eq!(table.sample_for("ACGT"), Some("sampleA"));
        assert_eq!(table.sample_for("acgt"), Some("sampleA"));
        assert_eq!(table.sample_for("TTTT"), Some("sampleB"));
    }

    #[test]
    fn expands_ambiguous_codes() {
        let table = BarcodeTable::parse(Cursor::new("sampleA\tACRT\n")).unwrap();
        assert_eq!(table.sample_for("ACAT"), Some("sampleA"));
        assert_eq!(table.sample_for("ACGT"), Some("sampleA"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn rejects_duplicate_sample() {
        let err = BarcodeTable::parse(Cursor::new("sampleA\tACGT\nsampleA\tTTTT\n"));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_invalid_base() {
        let err = BarcodeTable::parse(Cursor::new("sampleA\tACGX\n"));
        assert!(err.is_err());
    }
}
