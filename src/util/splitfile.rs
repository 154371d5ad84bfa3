//! Detects multi-part split archives (`a.tar.001`, `a.tar.002`, ... or
//! `a.taraa`, `a.tarab`, ...) from a flat file listing, and joins the
//! parts into one logical stream via [`crate::stencil::FactoryJoinedFile`].

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use crate::stencil::{FactoryJoinedFile, ReadSeek};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    Decimal,
    LowerHex,
    LowerLatin,
}

impl Alphabet {
    fn matches(self, s: &str) -> bool {
        match self {
            Alphabet::Decimal => !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
            Alphabet::LowerHex => !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)),
            Alphabet::LowerLatin => !s.is_empty() && s.bytes().all(|b| (b'a'..=b'z').contains(&b)),
        }
    }

    /// Interprets `s` as a fixed-width number in this alphabet: decimal and
    /// hex are read as base-10/base-16 integers; lowercase-latin suffixes
    /// are read as a base-26 "spreadsheet column" counter (`a`=0, `z`=25,
    /// `aa`=26, ...).
    fn value(self, s: &str) -> Option<u64> {
        match self {
            Alphabet::Decimal => u64::from_str_radix(s, 10).ok(),
            Alphabet::LowerHex => u64::from_str_radix(s, 16).ok(),
            Alphabet::LowerLatin => {
                let mut v: u64 = 0;
                for b in s.bytes() {
                    if !(b'a'..=b'z').contains(&b) {
                        return None;
                    }
                    v = v.checked_mul(26)?.checked_add((b - b'a') as u64)?;
                }
                Some(v)
            }
        }
    }

    const ALL: [Alphabet; 3] = [Alphabet::Decimal, Alphabet::LowerHex, Alphabet::LowerLatin];
}

/// A detected run of split-file parts: `base_name`'s siblings with a fixed
/// prefix length and a contiguous numbered suffix of the same width.
#[derive(Debug, Clone)]
pub struct SplitSequence {
    pub parts: Vec<PathBuf>,
}

/// Finds the longest contiguous split-file sequence among `candidates`
/// that starts with `seed`. All candidate names must share `seed`'s
/// directory. Alphabet classes are tried in order (decimal, lower-hex,
/// lower-latin); when more than one alphabet yields a valid run from the
/// same prefix, the longest run wins, matching the reference's
/// disambiguation rule.
pub fn find_split_sequence(seed: &Path, candidates: &[PathBuf]) -> Option<SplitSequence> {
    let dir = seed.parent()?;
    let seed_name = seed.file_name()?.to_str()?;

    let mut same_dir_names: Vec<String> = candidates
        .iter()
        .filter(|p| p.parent() == Some(dir))
        .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
        .collect();
    same_dir_names.sort();
    same_dir_names.dedup();

    if !same_dir_names.iter().any(|n| n == seed_name) {
        return None;
    }

    let width = seed_name.len();
    let same_width: Vec<&String> = same_dir_names.iter().filter(|n| n.len() == width).collect();
    if same_width.len() < 2 {
        return None;
    }

    // Find the longest common prefix length shared by all same-width names.
    let prefix_len = common_prefix_len(&same_width);
    if prefix_len == 0 || prefix_len >= width {
        return None;
    }

    let mut best: Option<Vec<String>> = None;
    for alphabet in Alphabet::ALL {
        let mut entries: Vec<(u64, String)> = Vec::new();
        let mut all_match = true;
        for name in &same_width {
            let suffix = &name[prefix_len..];
            if !alphabet.matches(suffix) {
                all_match = false;
                break;
            }
            match alphabet.value(suffix) {
                Some(v) => entries.push((v, (*name).clone())),
                None => {
                    all_match = false;
                    break;
                }
            }
        }
        if !all_match || entries.len() < 2 {
            continue;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        // Require a contiguous run (no gaps) to count as one sequence.
        let contiguous = entries.windows(2).all(|w| w[1].0 == w[0].0 + 1);
        if !contiguous {
            continue;
        }
        let run: Vec<String> = entries.into_iter().map(|(_, name)| name).collect();
        let is_better = best.as_ref().map(|b| run.len() > b.len()).unwrap_or(true);
        if is_better {
            best = Some(run);
        }
    }

    best.map(|names| SplitSequence { parts: names.into_iter().map(|n| dir.join(n)).collect() })
}

fn common_prefix_len(names: &[&String]) -> usize {
    let first = names[0].as_bytes();
    let mut len = first.len();
    for name in &names[1..] {
        let bytes = name.as_bytes();
        let mut i = 0;
        while i < len && i < bytes.len() && bytes[i] == first[i] {
            i += 1;
        }
        len = i;
    }
    len
}

/// Opens a detected split sequence as one logical seekable stream. Parts
/// are opened one at a time via the factory closure to bound file
/// descriptor use, matching [`FactoryJoinedFile`]'s contract.
pub fn open_sequence(seq: &SplitSequence) -> io::Result<FactoryJoinedFile<impl Fn(usize) -> io::Result<Box<dyn ReadSeek>>>> {
    let mut sizes = Vec::with_capacity(seq.parts.len());
    for part in &seq.parts {
        sizes.push(std::fs::metadata(part)?.len());
    }
    let parts = seq.parts.clone();
    let factory = move |idx: usize| -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(std::fs::File::open(&parts[idx])?))
    };
    Ok(FactoryJoinedFile::new(factory, sizes))
}

impl PartialEq for SplitSequence {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for SplitSequence {}

impl PartialOrd for SplitSequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.parts.len().cmp(&other.parts.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_decimal_numbered_parts() {
        let dir = PathBuf::from("/data");
        let seed = dir.join("archive.tar.001");
        let candidates = vec![
            dir.join("archive.tar.001"),
            dir.join("archive.tar.002"),
            dir.join("archive.tar.003"),
            dir.join("unrelated.txt"),
        ];
        let seq = find_split_sequence(&seed, &candidates).unwrap();
        assert_eq!(seq.parts.len(), 3);
        assert_eq!(seq.parts[0], dir.join("archive.tar.001"));
        assert_eq!(seq.parts[2], dir.join("archive.tar.003"));
    }

    #[test]
    fn detects_lowercase_latin_parts() {
        let dir = PathBuf::from("/data");
        let seed = dir.join("archive.taraa");
        let candidates = vec![dir.join("archive.taraa"), dir.join("archive.tarab"), dir.join("archive.tarac")];
        let seq = find_split_sequence(&seed, &candidates).unwrap();
        assert_eq!(seq.parts.len(), 3);
    }

    #[test]
    fn rejects_non_contiguous_sequences() {
        let dir = PathBuf::from("/data");
        let seed = dir.join("archive.tar.001");
        let candidates = vec![dir.join("archive.tar.001"), dir.join("archive.tar.003")];
        assert!(find_split_sequence(&seed, &candidates).is_none());
    }

    #[test]
    fn single_file_is_not_a_sequence() {
        let dir = PathBuf::from("/data");
        let seed = dir.join("archive.tar.001");
        let candidates = vec![dir.join("archive.tar.001")];
        assert!(find_split_sequence(&seed, &candidates).is_none());
    }
}
