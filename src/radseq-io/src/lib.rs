//! Shared I/O primitives: the cluster-stream codec (C1), FASTQ reading and
//! pair discovery, and barcode table parsing.

pub mod barcodes;
pub mod cluster;
pub mod fastq;

pub use barcodes::BarcodeTable;
pub use cluster::{Cluster, ClusterFormatError, ClusterReader, DerepRead, Orient};
pub use fastq::{FastqError, FastqReader, FastqRecord};
