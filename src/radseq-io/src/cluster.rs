//! The cluster-stream text format (C1): the wire format shared by every
//! stage from dereplication through the across-sample aligner.
//!
//! A cluster file is a sequence of clusters. Each cluster is a sequence of
//! `(header, sequence)` line pairs, followed by a two-line separator where
//! both lines are exactly `//`. A trailing separator may or may not be
//! present and must be tolerated on read.

use std::io::{BufRead, Write};

use located_error::prelude::*;
use thiserror::Error;

pub const SEPARATOR: &str = "//";

#[derive(Error, Debug)]
pub enum ClusterFormatError {
    #[error("cluster file has an odd number of content lines before a separator")]
    OddLineCount,

    #[error("expected a '//' separator line, found: '{0}'")]
    MissingSeparator(String),

    #[error("header line is missing the leading '>': '{0}'")]
    MissingHeaderMarker(String),

    #[error("header line is missing a 'size=' token: '{0}'")]
    MissingSize(String),
}

/// One dereplicated read within a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerepRead {
    /// Name with the leading `>` stripped, including any `;tag` suffix
    /// fields but excluding the trailing `;size=N;orient` tokens.
    pub name: String,
    pub tag: Option<String>,
    pub size: u32,
    pub orient: Orient,
    pub sequence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orient {
    Seed,
    Plus,
    Minus,
}

impl Orient {
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Orient::Seed => '*',
            Orient::Plus => '+',
            Orient::Minus => '-',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            '*' => Some(Orient::Seed),
            '+' => Some(Orient::Plus),
            '-' => Some(Orient::Minus),
            _ => None,
        }
    }
}

/// An ordered list of dereplicated reads: `rows[0]` is always the seed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    pub rows: Vec<DerepRead>,
}

impl Cluster {
    #[must_use]
    pub fn seed(&self) -> Option<&DerepRead> {
        self.rows.first()
    }

    #[must_use]
    pub fn depth(&self) -> u64 {
        self.rows.iter().map(|r| u64::from(r.size)).sum()
    }
}

/// Parse a `>name;[tag;]size=N;orient` header, with the leading `>` already
/// stripped. Tolerates arbitrary extra `;`-delimited tokens: only `size=`
/// and the trailing orientation character are load-bearing.
fn parse_header(header: &str) -> Result<(String, Option<String>, u32, Orient), ClusterFormatError> {
    let fields: Vec<&str> = header.split(';').collect();
    let name = fields.first().copied().unwrap_or("").to_string();

    let size_field = fields
        .iter()
        .find(|f| f.starts_with("size="))
        .ok_or_else(|| ClusterFormatError::MissingSize(header.to_string()))?;
    let size: u32 = size_field
        .trim_start_matches("size=")
        .parse()
        .map_err(|_| ClusterFormatError::MissingSize(header.to_string()))?;

    let orient = fields
        .last()
        .and_then(|f| f.chars().next())
        .and_then(Orient::from_char)
        .ok_or_else(|| ClusterFormatError::MissingSize(header.to_string()))?;

    // A tag is any field between the name and `size=`/orient that isn't itself size= or orient.
    let tag = fields
        .iter()
        .skip(1)
        .find(|f| !f.starts_with("size=") && !f.is_empty() && f.len() > 1)
        .map(|s| (*s).to_string());

    Ok((name, tag, size, orient))
}

impl DerepRead {
    /// Render back to the `>name;[tag;]size=N;orient` header grammar
    /// (without the leading `>`).
    #[must_use]
    pub fn header(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{};{};size={};{}", self.name, tag, self.size, self.orient.as_char()),
            None => format!("{};size={};{}", self.name, self.size, self.orient.as_char()),
        }
    }
}

/// Parse a single cluster's raw `(header, sequence)` lines.
fn parse_cluster_lines(lines: &[(String, String)]) -> anyhow::Result<Cluster> {
    let mut rows = Vec::with_capacity(lines.len());
    for (header, sequence) in lines {
        let header_body = header
            .strip_prefix('>')
            .ok_or_else(|| ClusterFormatError::MissingHeaderMarker(header.clone()))
            .loc("While parsing cluster header")?;
        let (name, tag, size, orient) =
            parse_header(header_body).loc("While parsing cluster header fields")?;
        rows.push(DerepRead { name, tag, size, orient, sequence: sequence.clone() });
    }
    Ok(Cluster { rows })
}

/// Lazily stream clusters out of a `BufRead` source. Each call to `next()`
/// reads exactly one cluster, stopping at (and consuming) its `//\n//\n`
/// separator. Returns `None` once the source is exhausted; a lone trailing
/// separator with no further content is tolerated and also yields `None`.
pub struct ClusterReader<R: BufRead> {
    source: R,
}

impl<R: BufRead> ClusterReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Pull the next cluster off the stream.
    ///
    /// # Errors
    /// [`ClusterFormatError`] if the line count before a separator is odd,
    /// if a non-separator line appears where a separator was expected, or
    /// if a header fails to parse.
    pub fn read_cluster(&mut self) -> anyhow::Result<Option<Cluster>> {
        let mut lines = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self.source.read_line(&mut buf).loc("While reading cluster file")?;
            if n == 0 {
                // EOF.
                return if lines.is_empty() {
                    Ok(None)
                } else {
                    Err(ClusterFormatError::OddLineCount).loc("Unexpected EOF mid-cluster")
                };
            }
            let line = buf.trim_end_matches(['\n', '\r']).to_string();
            if line == SEPARATOR {
                // First separator line; consume the paired second line.
                buf.clear();
                let n2 = self.source.read_line(&mut buf).loc("While reading cluster separator")?;
                if n2 > 0 {
                    let second = buf.trim_end_matches(['\n', '\r']);
                    if second != SEPARATOR {
                        return Err(ClusterFormatError::MissingSeparator(second.to_string()))
                            .loc("While reading cluster separator");
                    }
                }
                if lines.is_empty() {
                    // Empty cluster (tolerate a leading/trailing separator stray).
                    continue;
                }
                let headers_seqs: Vec<(String, String)> = lines;
                return Ok(Some(parse_cluster_lines(&headers_seqs)?));
            }
            lines.push((line, String::new()));
            // Read the paired sequence line.
            buf.clear();
            let n_seq = self.source.read_line(&mut buf).loc("While reading cluster sequence line")?;
            if n_seq == 0 {
                return Err(ClusterFormatError::OddLineCount).loc("Unexpected EOF after header line");
            }
            let last = lines.last_mut().expect("just pushed");
            last.1 = buf.trim_end_matches(['\n', '\r']).to_string();
        }
    }
}

impl<R: BufRead> Iterator for ClusterReader<R> {
    type Item = anyhow::Result<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_cluster() {
            Ok(Some(cluster)) => Some(Ok(cluster)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Write a stream of clusters, preserving the separator contract. Does not
/// write a trailing separator after the last cluster.
///
/// # Errors
/// Propagates the underlying writer's I/O errors.
pub fn write_clusters<W: Write>(mut sink: W, clusters: impl IntoIterator<Item = Cluster>) -> anyhow::Result<()> {
    let mut first = true;
    for cluster in clusters {
        if !first {
            writeln!(sink, "{SEPARATOR}").loc("While writing cluster separator")?;
            writeln!(sink, "{SEPARATOR}").loc("While writing cluster separator")?;
        }
        first = false;
        for row in &cluster.rows {
            writeln!(sink, ">{}", row.header()).loc("While writing cluster header")?;
            writeln!(sink, "{}", row.sequence).loc("While writing cluster sequence")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_text() -> &'static str {
        ">read1;size=3;*\nACGTACGT\n>read2;size=1;+\nACGTACGT\n//\n//\n>read3;size=5;*\nACGTACGT\n//\n//\n"
    }

    #[test]
    fn reads_two_clusters() {
        let mut reader = ClusterReader::new(Cursor::new(sample_text()));
        let c1 = reader.read_cluster().unwrap().unwrap();
        assert_eq!(c1.rows.len(), 2);
        assert_eq!(c1.seed().unwrap().name, "read1");
        assert_eq!(c1.seed().unwrap().orient, Orient::Seed);
        assert_eq!(c1.depth(), 4);

        let c2 = reader.read_cluster().unwrap().unwrap();
        assert_eq!(c2.rows.len(), 1);
        assert!(reader.read_cluster().unwrap().is_none());
    }

    #[test]
    fn tolerates_trailing_separator() {
        let text = ">read1;size=1;*\nACGT\n//\n//\n";
        let clusters: Vec<_> = ClusterReader::new(Cursor::new(text)).collect::<anyhow::Result<_>>().unwrap();
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn roundtrip_write_then_read() {
        let cluster = Cluster {
            rows: vec![
                DerepRead { name: "a".into(), tag: None, size: 3, orient: Orient::Seed, sequence: "ACGT".into() },
                DerepRead { name: "b".into(), tag: Some("tagA".into()), size: 1, orient: Orient::Plus, sequence: "ACGA".into() },
            ],
        };
        let mut buf = Vec::new();
        write_clusters(&mut buf, vec![cluster.clone()]).unwrap();
        let read_back = ClusterReader::new(Cursor::new(buf)).read_cluster().unwrap().unwrap();
        assert_eq!(read_back, cluster);
    }

    #[test]
    fn header_parsing_extracts_size_and_orient() {
        let (name, tag, size, orient) = parse_header("sample_001;dupABC;size=42;-").unwrap();
        assert_eq!(name, "sample_001");
        assert_eq!(tag, Some("dupABC".to_string()));
        assert_eq!(size, 42);
        assert_eq!(orient, Orient::Minus);
    }

    #[test]
    fn rejects_missing_size() {
        assert!(parse_header("name;*").is_err());
    }
}
