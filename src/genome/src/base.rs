use std::{borrow::Borrow, convert::TryFrom, fmt};

use thiserror::Error;

/// A single basecall, as encoded within cluster files, consensus sequences and
/// the `.loci`/`.snps` outputs.
///
/// Covers the four canonical nucleotides, the ambiguity/unknown marker `N`,
/// the gap character `-`, and the six IUPAC heterozygote codes produced by
/// the consensus caller (R, Y, S, W, K, M). This is the base-level analog of
/// the pedigree side's `Allele` type: same shape, different alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Base {
    A,
    C,
    G,
    T,
    N,
    Gap,
    /// A/G heterozygote
    R,
    /// C/T heterozygote
    Y,
    /// C/G heterozygote
    S,
    /// A/T heterozygote
    W,
    /// G/T heterozygote
    K,
    /// A/C heterozygote
    M,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BaseError {
    #[error("'{0}' is not a recognized base or IUPAC ambiguity code")]
    UnknownSymbol(char),
}

impl Base {
    /// `true` for the four unambiguous nucleotides.
    #[must_use]
    pub fn is_canonical(self) -> bool {
        matches!(self, Base::A | Base::C | Base::G | Base::T)
    }

    /// `true` for any of the six IUPAC two-state heterozygote codes.
    #[must_use]
    pub fn is_heterozygote(self) -> bool {
        matches!(self, Base::R | Base::Y | Base::S | Base::W | Base::K | Base::M)
    }

    /// Decompose a heterozygote code into its two constituent canonical
    /// bases. Returns `None` for anything that isn't one of the six codes.
    #[must_use]
    pub fn alleles(self) -> Option<(Base, Base)> {
        match self {
            Base::R => Some((Base::A, Base::G)),
            Base::Y => Some((Base::C, Base::T)),
            Base::S => Some((Base::C, Base::G)),
            Base::W => Some((Base::A, Base::T)),
            Base::K => Some((Base::G, Base::T)),
            Base::M => Some((Base::A, Base::C)),
            _ => None,
        }
    }

    /// Encode a pair of canonical bases into the IUPAC heterozygote code.
    /// The pair order does not matter. Returns `None` if either base isn't
    /// canonical, or if the pair names the same base twice.
    #[must_use]
    pub fn from_pair(a: Base, b: Base) -> Option<Base> {
        use Base::{A, C, G, K, M, R, S, T, W, Y};
        match (a, b) {
            (A, G) | (G, A) => Some(R),
            (C, T) | (T, C) => Some(Y),
            (C, G) | (G, C) => Some(S),
            (A, T) | (T, A) => Some(W),
            (G, T) | (T, G) => Some(K),
            (A, C) | (C, A) => Some(M),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_known(self) -> bool {
        !matches!(self, Base::N | Base::Gap)
    }
}

impl TryFrom<char> for Base {
    type Error = BaseError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c.to_ascii_uppercase() {
            'A' => Ok(Base::A),
            'C' => Ok(Base::C),
            'G' => Ok(Base::G),
            'T' => Ok(Base::T),
            'N' => Ok(Base::N),
            '-' => Ok(Base::Gap),
            'R' => Ok(Base::R),
            'Y' => Ok(Base::Y),
            'S' => Ok(Base::S),
            'W' => Ok(Base::W),
            'K' => Ok(Base::K),
            'M' => Ok(Base::M),
            other => Err(BaseError::UnknownSymbol(other)),
        }
    }
}

impl std::str::FromStr for Base {
    type Err = BaseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Base::try_from(c),
            _ => Err(BaseError::UnknownSymbol(s.chars().next().unwrap_or('\0'))),
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Base::A => 'A',
            Base::C => 'C',
            Base::G => 'G',
            Base::T => 'T',
            Base::N => 'N',
            Base::Gap => '-',
            Base::R => 'R',
            Base::Y => 'Y',
            Base::S => 'S',
            Base::W => 'W',
            Base::K => 'K',
            Base::M => 'M',
        };
        write!(f, "{c}")
    }
}

impl Borrow<char> for Base {
    fn borrow(&self) -> &char {
        match self {
            Base::A => &'A',
            Base::C => &'C',
            Base::G => &'G',
            Base::T => &'T',
            Base::N => &'N',
            Base::Gap => &'-',
            Base::R => &'R',
            Base::Y => &'Y',
            Base::S => &'S',
            Base::W => &'W',
            Base::K => &'K',
            Base::M => &'M',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_canonical() {
        for c in ['A', 'C', 'G', 'T', 'N', '-'] {
            let base = Base::try_from(c).unwrap();
            assert_eq!(base.to_string().chars().next().unwrap(), c);
        }
    }

    #[test]
    fn heterozygote_pairs() {
        assert_eq!(Base::from_pair(Base::A, Base::G), Some(Base::R));
        assert_eq!(Base::from_pair(Base::G, Base::A), Some(Base::R));
        assert_eq!(Base::R.alleles(), Some((Base::A, Base::G)));
        assert!(Base::R.is_heterozygote());
        assert!(!Base::A.is_heterozygote());
    }

    #[test]
    fn rejects_unknown_symbol() {
        assert_eq!(Base::try_from('X'), Err(BaseError::UnknownSymbol('X')));
    }

    #[test]
    fn gap_and_n_are_unknown() {
        assert!(!Base::N.is_known());
        assert!(!Base::Gap.is_known());
        assert!(Base::A.is_known());
    }
}
