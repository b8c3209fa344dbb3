//! C7: across-sample locus assembly and filtering (spec §4.7).

use std::collections::{HashMap, HashSet};

use genome::Base;
use parser::Params;

/// One sample's consensus row within an across-sample locus.
#[derive(Debug, Clone)]
pub struct LocusRow {
    pub sample: String,
    pub sequence: String,
    pub internal_indels: u32,
}

#[derive(Debug, Clone)]
pub struct Locus {
    pub rows: Vec<LocusRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    Dups,
    MinSamp,
    MaxInd,
    MaxVar,
    MaxShared,
}

impl FilterReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FilterReason::Dups => "dups",
            FilterReason::MinSamp => "minsamp",
            FilterReason::MaxInd => "maxind",
            FilterReason::MaxVar => "maxvar",
            FilterReason::MaxShared => "maxshared",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterCounts {
    pub dups: u64,
    pub minsamp: u64,
    pub maxind: u64,
    pub maxvar: u64,
    pub maxshared: u64,
    pub passed: u64,
}

impl FilterCounts {
    fn record(&mut self, reason: FilterReason) {
        match reason {
            FilterReason::Dups => self.dups += 1,
            FilterReason::MinSamp => self.minsamp += 1,
            FilterReason::MaxInd => self.maxind += 1,
            FilterReason::MaxVar => self.maxvar += 1,
            FilterReason::MaxShared => self.maxshared += 1,
        }
    }
}

/// Positions of variable (SNP) and parsimony-informative (PIS) columns
/// within a locus, 0-indexed against the locus's alignment width.
#[derive(Debug, Clone, Default)]
pub struct VariantPositions {
    pub snps: Vec<usize>,
    pub pis: Vec<usize>,
}

fn duplicate_sample_filter(locus: &Locus) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    locus.rows.iter().all(|row| seen.insert(row.sample.as_str()))
}

fn min_sample_cov_filter(locus: &Locus, params: &Params) -> bool {
    let distinct: HashSet<&str> = locus.rows.iter().map(|r| r.sample.as_str()).collect();
    if (distinct.len() as u32) < params.min_samples_locus {
        return false;
    }
    for population in params.populations.values() {
        let present = locus.rows.iter().filter(|r| population.members.iter().any(|m| m == &r.sample)).count();
        if (present as u32) < population.mincov {
            return false;
        }
    }
    true
}

fn max_indels_filter(locus: &Locus, params: &Params) -> bool {
    locus.rows.iter().all(|row| row.internal_indels <= params.max_indels_locus)
}

fn transpose_columns(locus: &Locus) -> Vec<Vec<char>> {
    let width = locus.rows.iter().map(|r| r.sequence.len()).max().unwrap_or(0);
    let mut columns = vec![Vec::with_capacity(locus.rows.len()); width];
    for row in &locus.rows {
        let chars: Vec<char> = row.sequence.chars().collect();
        for (i, column) in columns.iter_mut().enumerate() {
            column.push(chars.get(i).copied().unwrap_or('N'));
        }
    }
    columns
}

/// Count variable (SNP) and parsimony-informative (PIS) sites, and check
/// the max-SNPs budget. Max-shared-heterozygosity is checked separately in
/// [`filter_locus`].
fn analyze_columns(locus: &Locus, params: &Params) -> (VariantPositions, bool) {
    let columns = transpose_columns(locus);
    let mut variants = VariantPositions::default();

    for (i, column) in columns.iter().enumerate() {
        let canonical: Vec<Base> = column.iter().filter_map(|&c| Base::try_from(c).ok()).filter(|b| b.is_known()).collect();
        let mut distinct_alleles: HashSet<Base> = HashSet::new();
        let mut samples_per_allele: HashMap<Base, usize> = HashMap::new();
        for &base in &canonical {
            if base.is_heterozygote() {
                if let Some((a, b)) = base.alleles() {
                    distinct_alleles.insert(a);
                    distinct_alleles.insert(b);
                    *samples_per_allele.entry(a).or_insert(0) += 1;
                    *samples_per_allele.entry(b).or_insert(0) += 1;
                }
            } else {
                distinct_alleles.insert(base);
                *samples_per_allele.entry(base).or_insert(0) += 1;
            }
        }
        if distinct_alleles.len() > 1 {
            variants.snps.push(i);
            if minor_allele_sample_count(&samples_per_allele) >= 2 {
                variants.pis.push(i);
            }
        }
    }

    let within_snp_budget = (variants.snps.len() as u32) <= params.max_snps_locus;
    (variants, within_snp_budget)
}

/// The number of samples carrying the second-most-common allele at a site
/// (the "minor allele" for the parsimony-informative-site definition).
fn minor_allele_sample_count(samples_per_allele: &HashMap<Base, usize>) -> usize {
    let mut counts: Vec<usize> = samples_per_allele.values().copied().collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));
    counts.get(1).copied().unwrap_or(0)
}

/// Apply every locus-level filter in spec-order, returning the first
/// rejection reason encountered, or `None` (and the variant positions) if
/// the locus is accepted.
pub fn filter_locus(locus: &Locus, params: &Params, counts: &mut FilterCounts) -> Result<VariantPositions, FilterReason> {
    if !duplicate_sample_filter(locus) {
        counts.record(FilterReason::Dups);
        return Err(FilterReason::Dups);
    }
    if !min_sample_cov_filter(locus, params) {
        counts.record(FilterReason::MinSamp);
        return Err(FilterReason::MinSamp);
    }
    if !max_indels_filter(locus, params) {
        counts.record(FilterReason::MaxInd);
        return Err(FilterReason::MaxInd);
    }
    let (variants, within_snp_budget) = analyze_columns(locus, params);
    if !within_snp_budget {
        counts.record(FilterReason::MaxVar);
        return Err(FilterReason::MaxVar);
    }
    let n_samples = locus.rows.len().max(1);
    let shared_h_ok = transpose_columns(locus).iter().all(|column| {
        let het = column.iter().filter(|&&c| Base::try_from(c).map(|b| b.is_heterozygote()).unwrap_or(false)).count();
        het == 0 || (het as f64) / (n_samples as f64) <= params.max_shared_h_locus
    });
    if !shared_h_ok {
        counts.record(FilterReason::MaxShared);
        return Err(FilterReason::MaxShared);
    }

    counts.passed += 1;
    Ok(variants)
}

/// Split a stream of loci into chunks sized for roughly 4 chunks per
/// worker, the parallelization granularity spec §4.7 calls for.
#[must_use]
pub fn chunk_loci(loci: Vec<Locus>, worker_count: usize) -> Vec<Vec<Locus>> {
    let worker_count = worker_count.max(1);
    let chunk_count = (worker_count * 4).max(1);
    let chunk_size = loci.len().div_ceil(chunk_count).max(1);
    loci.chunks(chunk_size).map(<[Locus]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locus(rows: &[(&str, &str)]) -> Locus {
        Locus {
            rows: rows.iter().map(|(s, seq)| LocusRow { sample: (*s).to_string(), sequence: (*seq).to_string(), internal_indels: 0 }).collect(),
        }
    }

    fn params_min_2() -> Params {
        let mut p = Params::default();
        p.min_samples_locus = 2;
        p
    }

    #[test]
    fn duplicate_sample_is_rejected() {
        let l = locus(&[("s1", "ACGT"), ("s1", "ACGT")]);
        let mut counts = FilterCounts::default();
        assert_eq!(filter_locus(&l, &params_min_2(), &mut counts), Err(FilterReason::Dups));
    }

    #[test]
    fn below_min_samples_is_rejected() {
        let l = locus(&[("s1", "ACGT")]);
        let mut counts = FilterCounts::default();
        assert_eq!(filter_locus(&l, &params_min_2(), &mut counts), Err(FilterReason::MinSamp));
    }

    #[test]
    fn clean_locus_with_enough_samples_passes() {
        let l = locus(&[("s1", "ACGT"), ("s2", "ACGT"), ("s3", "ACGT")]);
        let mut counts = FilterCounts::default();
        let result = filter_locus(&l, &params_min_2(), &mut counts);
        assert!(result.is_ok());
        assert_eq!(counts.passed, 1);
    }

    #[test]
    fn chunking_covers_every_locus() {
        let loci: Vec<Locus> = (0..40).map(|_| locus(&[("s1", "ACGT"), ("s2", "ACGT")])).collect();
        let chunks = chunk_loci(loci, 2);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 40);
    }
}
