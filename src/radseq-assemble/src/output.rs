//! C8: assemble the three canonical outputs — `.loci` text, the `seqs`
//! phylip-like table, and the `snps` genotype arrays — from the retained,
//! filtered loci (spec §4.8), plus the reference-mapped SAM emission
//! supplemented from `original_source` (spec §C.5).

use genome::{Base, FaiIndex, RefPos};

use crate::locus::{Locus, VariantPositions};

/// One retained locus plus its global 0-indexed id and, for reference
/// assemblies, the genomic span it was anchored to.
pub struct RetainedLocus {
    pub locus: Locus,
    pub global_id: u64,
    pub refpos: Option<RefPos>,
    pub variants: VariantPositions,
}

/// Render the SNP annotation string for a locus: `-` at invariant
/// columns, `*` at parsimony-informative sites, `+` at autapomorphies
/// (variant-but-not-PIS), one byte per alignment column.
#[must_use]
pub fn snp_string(width: usize, variants: &VariantPositions) -> String {
    let mut bytes = vec![b'-'; width];
    for &pos in &variants.snps {
        if pos < width {
            bytes[pos] = b'+';
        }
    }
    for &pos in &variants.pis {
        if pos < width {
            bytes[pos] = b'*';
        }
    }
    String::from_utf8(bytes).expect("snp string is ASCII by construction")
}

/// Render the trailing metadata suffix for a locus's penultimate `.loci`
/// line: `|idx|` for denovo assemblies, `|idx|chrom:pos0-pos1|` for
/// reference assemblies with the chromosome name resolved via the `.fai`.
#[must_use]
pub fn locus_metadata(global_id: u64, refpos: Option<RefPos>, fai: Option<&FaiIndex>) -> String {
    match (refpos, fai) {
        (Some(rp), Some(fai)) if rp.is_placed() => {
            let chrom = fai.name_of(rp.scaffold_id).unwrap_or("unknown");
            format!("|{global_id}|{chrom}:{}-{}|", rp.start, rp.end)
        }
        _ => format!("|{global_id}|"),
    }
}

/// Render one locus's full `.loci` text block: one line per sample row
/// (`name␣␣sequence`, padded so names align), then the SNP-string line.
#[must_use]
pub fn render_loci_block(retained: &RetainedLocus, fai: Option<&FaiIndex>) -> String {
    let name_width = retained.locus.rows.iter().map(|r| r.sample.len()).max().unwrap_or(0);
    let width = retained.locus.rows.iter().map(|r| r.sequence.len()).max().unwrap_or(0);

    let mut block = String::new();
    for row in &retained.locus.rows {
        block.push_str(&format!("{:<width$}  {}\n", row.sample, row.sequence, width = name_width));
    }
    let snps = snp_string(width, &retained.variants);
    let metadata = locus_metadata(retained.global_id, retained.refpos, fai);
    block.push_str(&format!("{:<width$}  {snps}{metadata}\n", "//", width = name_width));
    block
}

/// `(scaffold_id_1indexed, phy_start_0, phy_end_0, ref_start, ref_end)` for
/// one locus within the concatenated `seqs` alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhymapRow {
    pub scaffold_id: u32,
    pub phy_start: u64,
    pub phy_end: u64,
    pub ref_start: u32,
    pub ref_end: u32,
}

#[derive(Debug, Default)]
pub struct SeqsTable {
    /// sample name -> concatenated aligned sequence across all retained loci.
    pub rows: Vec<(String, String)>,
    pub phymap: Vec<PhymapRow>,
}

/// Build the concatenated `seqs` phylip-like table and its `phymap`
/// side-table across every retained locus, in locus order.
#[must_use]
pub fn build_seqs_table(retained: &[RetainedLocus], sample_names: &[String]) -> SeqsTable {
    let mut rows: Vec<(String, String)> = sample_names.iter().map(|n| (n.clone(), String::new())).collect();
    let mut phymap = Vec::with_capacity(retained.len());
    let mut cursor: u64 = 0;

    for entry in retained {
        let width = entry.locus.rows.iter().map(|r| r.sequence.len()).max().unwrap_or(0);
        for (name, seq) in &mut rows {
            let found = entry.locus.rows.iter().find(|r| r.sample == *name);
            match found {
                Some(row) => seq.push_str(&row.sequence),
                None => seq.push_str(&"N".repeat(width)),
            }
        }
        let refpos = entry.refpos.unwrap_or_else(RefPos::unplaced);
        phymap.push(PhymapRow {
            scaffold_id: refpos.scaffold_id,
            phy_start: cursor,
            phy_end: cursor + width as u64,
            ref_start: refpos.start,
            ref_end: refpos.end,
        });
        cursor += width as u64;
    }

    SeqsTable { rows, phymap }
}

/// `snps[nsamples, nsnps]` genotype codes: 0 homozygous-reference, 1
/// heterozygous, 2 homozygous-alternate, 9 missing. "Reference" is simply
/// the first observed canonical allele at that site.
#[derive(Debug, Default)]
pub struct SnpsTable {
    pub genotypes: Vec<Vec<u8>>,
    /// `(locus_id_1indexed, snp_index_on_locus_0, snp_pos_on_locus_1,
    /// locus_in_dataset_0, snp_in_dataset_0)`.
    pub snpsmap: Vec<(u64, usize, usize, u64, usize)>,
}

fn column_chars(locus: &Locus, col: usize) -> Vec<Option<char>> {
    locus.rows.iter().map(|r| r.sequence.chars().nth(col)).collect()
}

fn genotype_code(reference: Base, observed: Option<char>) -> u8 {
    let Some(c) = observed else { return 9 };
    let Ok(base) = Base::try_from(c) else { return 9 };
    if !base.is_known() {
        return 9;
    }
    if base.is_heterozygote() {
        return 1;
    }
    if base == reference {
        0
    } else {
        2
    }
}

/// Build the `snps`/`snpsmap` arrays across every retained locus's SNP
/// columns, keyed by sample order in `sample_names`.
#[must_use]
pub fn build_snps_table(retained: &[RetainedLocus], sample_names: &[String]) -> SnpsTable {
    let mut genotypes: Vec<Vec<u8>> = sample_names.iter().map(|_| Vec::new()).collect();
    let mut snpsmap = Vec::new();
    let mut snp_in_dataset = 0usize;

    for entry in retained {
        for (snp_idx, &col) in entry.variants.snps.iter().enumerate() {
            let chars = column_chars(&entry.locus, col);
            let reference = chars.iter().flatten().find_map(|&c| Base::try_from(c).ok().filter(Base::is_known)).unwrap_or(Base::N);

            for (row_idx, sample) in sample_names.iter().enumerate() {
                let observed = entry.locus.rows.iter().position(|r| &r.sample == sample).and_then(|i| chars[i]);
                genotypes[row_idx].push(genotype_code(reference, observed));
            }
            snpsmap.push((entry.global_id + 1, snp_idx, col, entry.global_id, snp_in_dataset));
            snp_in_dataset += 1;
        }
    }

    SnpsTable { genotypes, snpsmap }
}

/// Fixed CIGAR dictionary: gaps collapse to `D`, missing/pair-separator
/// bytes to `N`, every called base (including IUPAC heterozygote codes)
/// to `M`.
fn cigar_code(c: char) -> char {
    match c {
        '-' => 'D',
        'N' | 'n' => 'N',
        _ => 'M',
    }
}

/// Derive a synthetic CIGAR string from a trimmed consensus sequence:
/// runs of the same code (`M`/`N`/`D`) collapsed per the fixed CIGAR
/// dictionary (supplemented feature C.5).
#[must_use]
pub fn make_cigar(consensus: &str) -> String {
    let mut cigar = String::new();
    let mut run_len = 0u32;
    let mut run_code = None;
    for c in consensus.chars() {
        let code = cigar_code(c);
        match run_code {
            Some(prev) if prev == code => run_len += 1,
            Some(prev) => {
                cigar.push_str(&format!("{run_len}{prev}"));
                run_code = Some(code);
                run_len = 1;
            }
            None => {
                run_code = Some(code);
                run_len = 1;
            }
        }
    }
    if let Some(code) = run_code {
        cigar.push_str(&format!("{run_len}{code}"));
    }
    cigar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locus::LocusRow;

    fn locus(rows: &[(&str, &str)]) -> Locus {
        Locus { rows: rows.iter().map(|(s, seq)| LocusRow { sample: (*s).into(), sequence: (*seq).into(), internal_indels: 0 }).collect() }
    }

    #[test]
    fn snp_string_marks_pis_and_autapomorphy() {
        let variants = VariantPositions { snps: vec![1, 3], pis: vec![3] };
        let s = snp_string(5, &variants);
        assert_eq!(s, "-+-*-");
    }

    #[test]
    fn locus_metadata_uses_fai_for_reference_assemblies() {
        assert_eq!(locus_metadata(4, None, None), "|4|");
    }

    #[test]
    fn make_cigar_collapses_runs() {
        assert_eq!(make_cigar("AAAA--NN"), "4M2D2N");
    }

    #[test]
    fn build_seqs_table_pads_missing_samples_with_n() {
        let retained = vec![RetainedLocus {
            locus: locus(&[("s1", "ACGT")]),
            global_id: 0,
            refpos: None,
            variants: VariantPositions::default(),
        }];
        let names = vec!["s1".to_string(), "s2".to_string()];
        let table = build_seqs_table(&retained, &names);
        assert_eq!(table.rows[1].1, "NNNN");
        assert_eq!(table.phymap.len(), 1);
    }

    #[test]
    fn build_snps_table_encodes_genotypes() {
        let retained = vec![RetainedLocus {
            locus: locus(&[("s1", "A"), ("s2", "G"), ("s3", "R")]),
            global_id: 0,
            refpos: None,
            variants: VariantPositions { snps: vec![0], pis: vec![0] },
        }];
        let names = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let table = build_snps_table(&retained, &names);
        assert_eq!(table.genotypes[0][0], 0);
        assert_eq!(table.genotypes[1][0], 2);
        assert_eq!(table.genotypes[2][0], 1);
    }
}
