//! FASTQ reading and paired-file discovery for the demultiplex/trim stages.

use std::{
    collections::BTreeMap,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use gzp::{deflate::Gzip, par::decompress::ParDecompressBuilder};
use located_error::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FastqError {
    #[error("truncated FASTQ record: expected 4 lines, got {0}")]
    TruncatedRecord(usize),

    #[error("FASTQ record '+' separator line missing or malformed: '{0}'")]
    MalformedSeparator(String),

    #[error("sequence/quality length mismatch in record '{name}': {seq_len} vs {qual_len}")]
    LengthMismatch { name: String, seq_len: usize, qual_len: usize },

    #[error("could not find a unique pairing of _1/_2 style files in {0}")]
    NoPairing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    pub name: String,
    pub sequence: String,
    pub quality: String,
}

/// A streaming FASTQ reader over plain or gzip-compressed input.
pub struct FastqReader<R: BufRead> {
    source: R,
}

impl FastqReader<BufReader<Box<dyn Read>>> {
    /// Open a FASTQ file, transparently decompressing if it ends in `.gz`.
    ///
    /// # Errors
    /// Propagates the underlying file-open error.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_loc(|| format!("While opening FASTQ file '{}'", path.display()))?;
        let reader: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            ParDecompressBuilder::<Gzip>::new().maybe_num_threads(1).maybe_par_from_reader(file)
        } else {
            Box::new(file)
        };
        Ok(Self { source: BufReader::new(reader) })
    }
}

impl<R: BufRead> FastqReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    fn read_record(&mut self) -> anyhow::Result<Option<FastqRecord>> {
        let mut name_line = String::new();
        if self.source.read_line(&mut name_line).loc("While reading FASTQ name line")? == 0 {
            return Ok(None);
        }
        let name = name_line
            .trim_end_matches(['\n', '\r'])
            .strip_prefix('@')
            .unwrap_or(name_line.trim())
            .to_string();

        let mut seq_line = String::new();
        let mut plus_line = String::new();
        let mut qual_line = String::new();
        let mut lines_read = 1;
        for buf in [&mut seq_line, &mut plus_line, &mut qual_line] {
            if self.source.read_line(buf).loc("While reading FASTQ record body")? == 0 {
                return Err(FastqError::TruncatedRecord(lines_read)).loc("While reading FASTQ record");
            }
            lines_read += 1;
        }
        let sequence = seq_line.trim_end_matches(['\n', '\r']).to_string();
        let plus = plus_line.trim_end_matches(['\n', '\r']);
        if !plus.starts_with('+') {
            return Err(FastqError::MalformedSeparator(plus.to_string())).loc("While parsing FASTQ '+' line");
        }
        let quality = qual_line.trim_end_matches(['\n', '\r']).to_string();
        if sequence.len() != quality.len() {
            return Err(FastqError::LengthMismatch { name, seq_len: sequence.len(), qual_len: quality.len() })
                .loc("While validating a FASTQ record");
        }
        Ok(Some(FastqRecord { name, sequence, quality }))
    }
}

impl<R: BufRead> Iterator for FastqReader<R> {
    type Item = anyhow::Result<FastqRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Discover `_1/_2`, `_R1/_R2` or `_R1_/_R2_` style paired files in a
/// directory by peeling `_`-delimited suffix tokens from the right until a
/// unique grouping yields pairs of exactly two files.
///
/// # Errors
/// [`FastqError::NoPairing`] if no grouping produces clean pairs.
pub fn discover_pairs(files: &[PathBuf]) -> anyhow::Result<Vec<(PathBuf, Option<PathBuf>)>> {
    const MARKERS: [(&str, &str); 3] = [("_1", "_2"), ("_R1", "_R2"), ("_R1_", "_R2_")];

    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        let stem = file.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let key = MARKERS
            .iter()
            .find_map(|(m1, m2)| {
                if stem.contains(m1) {
                    Some(stem.replacen(m1, "", 1))
                } else if stem.contains(m2) {
                    Some(stem.replacen(m2, "", 1))
                } else {
                    None
                }
            })
            .unwrap_or(stem);
        groups.entry(key).or_default().push(file.clone());
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, mut members) in groups {
        members.sort();
        match members.len() {
            1 => out.push((members.remove(0), None)),
            2 => out.push((members[0].clone(), Some(members[1].clone()))),
            _ => {
                return Err(FastqError::NoPairing(key)).loc("While discovering paired FASTQ files");
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_a_single_record() {
        let text = "@read1\nACGTACGT\n+\nIIIIIIII\n";
        let mut reader = FastqReader::new(Cursor::new(text));
        let rec = reader.next().unwrap().unwrap();
        assert_eq!(rec.name, "read1");
        assert_eq!(rec.sequence, "ACGTACGT");
        assert!(reader.next().is_none());
    }

    #[test]
    fn rejects_length_mismatch() {
        let text = "@read1\nACGT\n+\nII\n";
        let mut reader = FastqReader::new(Cursor::new(text));
        assert!(reader.next().unwrap().is_err());
    }

    #[test]
    fn discovers_r1_r2_pairs() {
        let files = vec![PathBuf::from("sampleA_R1.fastq"), PathBuf::from("sampleA_R2.fastq"), PathBuf::from("sampleB.fastq")];
        let pairs = discover_pairs(&files).unwrap();
        assert_eq!(pairs.len(), 2);
        let paired = pairs.iter().find(|(_, r2)| r2.is_some()).unwrap();
        assert_eq!(paired.0, PathBuf::from("sampleA_R1.fastq"));
        assert_eq!(paired.1, Some(PathBuf::from("sampleA_R2.fastq")));
    }
}
