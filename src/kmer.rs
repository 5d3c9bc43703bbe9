/*
Copyright (c) 2020 Pierre Marijon <pierre@marijon.fr>

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

/* crate use */
use num_traits::PrimInt;

/* local use */
use crate::error::Error;

/// Storage integer for a 2 bits packed kmer, first base in the high bits.
///
/// Two widths cover all supported kmer sizes: u64 up to k = 31, u128 up to
/// k = 63. Dispatch happens once at the entry point, everything downstream is
/// generic.
pub trait KmerSpace:
    PrimInt + std::hash::Hash + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static
{
    const BITS: u32;
    const MAX_K: u8;

    fn from_bit(bit: u8) -> Self;
    fn low_u64(self) -> u64;
    fn revcomp(self, k: u8) -> Self;
    fn write_le(self, buf: &mut [u8]);
    fn read_le(buf: &[u8]) -> Self;
}

impl KmerSpace for u64 {
    const BITS: u32 = 64;
    const MAX_K: u8 = 31;

    fn from_bit(bit: u8) -> Self {
        bit as u64
    }

    fn low_u64(self) -> u64 {
        self
    }

    fn revcomp(self, k: u8) -> Self {
        let mut x = self.swap_bytes();
        x = (x >> 4) & 0x0F0F_0F0F_0F0F_0F0F | (x & 0x0F0F_0F0F_0F0F_0F0F) << 4;
        x = (x >> 2) & 0x3333_3333_3333_3333 | (x & 0x3333_3333_3333_3333) << 2;
        (x ^ 0xAAAA_AAAA_AAAA_AAAA) >> (64 - 2 * k as u32)
    }

    fn write_le(self, buf: &mut [u8]) {
        let bytes = self.to_le_bytes();
        buf.copy_from_slice(&bytes[..buf.len()]);
    }

    fn read_le(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..buf.len()].copy_from_slice(buf);
        u64::from_le_bytes(bytes)
    }
}

impl KmerSpace for u128 {
    const BITS: u32 = 128;
    const MAX_K: u8 = 63;

    fn from_bit(bit: u8) -> Self {
        bit as u128
    }

    fn low_u64(self) -> u64 {
        self as u64
    }

    fn revcomp(self, k: u8) -> Self {
        let mut x = self.swap_bytes();
        x = (x >> 4) & 0x0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0F
            | (x & 0x0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0F_0F0F) << 4;
        x = (x >> 2) & 0x3333_3333_3333_3333_3333_3333_3333_3333
            | (x & 0x3333_3333_3333_3333_3333_3333_3333_3333) << 2;
        (x ^ 0xAAAA_AAAA_AAAA_AAAA_AAAA_AAAA_AAAA_AAAA) >> (128 - 2 * k as u32)
    }

    fn write_le(self, buf: &mut [u8]) {
        let bytes = self.to_le_bytes();
        buf.copy_from_slice(&bytes[..buf.len()]);
    }

    fn read_le(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..buf.len()].copy_from_slice(buf);
        u128::from_le_bytes(bytes)
    }
}

/// Kmer width bucket, chosen once from k.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W64,
    W128,
}

impl Width {
    pub fn for_k(k: u8) -> Result<Width, Error> {
        if k < 2 {
            Err(Error::InvalidInput {
                message: format!("kmer size {} is too small, minimal value is 2", k),
            })
        } else if k <= u64::MAX_K {
            Ok(Width::W64)
        } else if k <= u128::MAX_K {
            Ok(Width::W128)
        } else {
            Err(Error::InvalidInput {
                message: format!("kmer size {} is too large, maximal value is 63", k),
            })
        }
    }
}

pub fn nuc2bit(nuc: u8) -> u8 {
    (nuc >> 1) & 0b11
}

pub fn valid_nuc(nuc: u8) -> bool {
    matches!(nuc, b'A' | b'C' | b'T' | b'G' | b'a' | b'c' | b't' | b'g')
}

pub fn bit2nuc(bit: u8) -> u8 {
    [b'A', b'C', b'T', b'G'][(bit & 0b11) as usize]
}

pub fn mask<T: KmerSpace>(k: u8) -> T {
    (T::one() << (2 * k as usize)) - T::one()
}

pub fn seq2bit<T: KmerSpace>(seq: &[u8]) -> T {
    seq.iter().fold(T::zero(), |kmer, nuc| {
        (kmer << 2) | T::from_bit(nuc2bit(*nuc))
    })
}

pub fn kmer2seq<T: KmerSpace>(kmer: T, k: u8) -> String {
    (0..k)
        .rev()
        .map(|i| bit2nuc((kmer >> (2 * i as usize)).low_u64() as u8 & 0b11) as char)
        .collect()
}

pub fn comp<T: KmerSpace>(kmer: T, k: u8) -> T {
    let mut pattern = T::zero();
    for _ in 0..k {
        pattern = (pattern << 2) | (T::one() << 1);
    }
    kmer ^ pattern
}

pub fn revcomp<T: KmerSpace>(kmer: T, k: u8) -> T {
    KmerSpace::revcomp(kmer, k)
}

/// Smallest of a kmer and its reverse complement, plus a strand flag, true
/// when the kmer already was the cannonical one.
pub fn cannonical<T: KmerSpace>(kmer: T, k: u8) -> (T, bool) {
    let rc = revcomp(kmer, k);
    if kmer <= rc {
        (kmer, true)
    } else {
        (rc, false)
    }
}

pub fn succ<T: KmerSpace>(kmer: T, k: u8, bit: u8) -> T {
    ((kmer << 2) | T::from_bit(bit)) & mask::<T>(k)
}

pub fn pred<T: KmerSpace>(kmer: T, k: u8, bit: u8) -> T {
    (kmer >> 2) | (T::from_bit(bit) << (2 * (k - 1) as usize))
}

/// First k-1 bases of the kmer.
pub fn prefix<T: KmerSpace>(kmer: T) -> T {
    kmer >> 2
}

/// Last k-1 bases of the kmer.
pub fn suffix<T: KmerSpace>(kmer: T, k: u8) -> T {
    kmer & mask::<T>(k - 1)
}

/// Number of bytes used to store one kmer on disk.
pub fn bytes_per_kmer(k: u8) -> usize {
    (2 * k as usize + 7) / 8
}

/// One valid kmer of a sequence, both strands are rolled together.
#[derive(Debug, Clone, Copy)]
pub struct Token<T> {
    pub forward: T,
    pub reverse: T,
    /// True for the first kmer of the sequence and the first one after a
    /// break on an unknown base.
    pub is_first: bool,
    /// Index just past the last base of this kmer in the sequence.
    pub end: usize,
}

impl<T: KmerSpace> Token<T> {
    pub fn cannonical(&self) -> (T, bool) {
        if self.forward <= self.reverse {
            (self.forward, true)
        } else {
            (self.reverse, false)
        }
    }
}

/// Iterate over all valid kmers of a sequence.
///
/// A kmer spanning an unknown base is never emitted, the window restarts at
/// the next valid base.
pub struct Tokenizer<'a, T> {
    seq: &'a [u8],
    k: u8,
    kmer_mask: T,
    i: usize,
    forward: T,
    reverse: T,
    filled: u8,
    fresh: bool,
}

impl<'a, T: KmerSpace> Tokenizer<'a, T> {
    pub fn new(seq: &'a [u8], k: u8) -> Self {
        Tokenizer {
            seq,
            k,
            kmer_mask: mask::<T>(k),
            i: 0,
            forward: T::zero(),
            reverse: T::zero(),
            filled: 0,
            fresh: true,
        }
    }
}

impl<'a, T: KmerSpace> Iterator for Tokenizer<'a, T> {
    type Item = Token<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.i < self.seq.len() {
            let nuc = self.seq[self.i];
            self.i += 1;

            if !valid_nuc(nuc) {
                self.filled = 0;
                self.fresh = true;
                continue;
            }

            let bit = nuc2bit(nuc);
            self.forward = ((self.forward << 2) | T::from_bit(bit)) & self.kmer_mask;
            self.reverse =
                (self.reverse >> 2) | (T::from_bit(bit ^ 0b10) << (2 * (self.k - 1) as usize));

            if self.filled < self.k {
                self.filled += 1;
            }

            if self.filled == self.k {
                let is_first = self.fresh;
                self.fresh = false;
                return Some(Token {
                    forward: self.forward,
                    reverse: self.reverse,
                    is_first,
                    end: self.i,
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq2bit_() {
        // TAGGC -> 10 00 11 11 01
        assert_eq!(seq2bit::<u64>(b"TAGGC"), 0b1000111101);
        assert_eq!(seq2bit::<u128>(b"TAGGC"), 0b1000111101);
    }

    #[test]
    fn kmer2seq_() {
        assert_eq!(kmer2seq(0b1000111101u64, 5), "TAGGC");
        assert_eq!(kmer2seq(seq2bit::<u64>(b"AATGC"), 5), "AATGC");
    }

    #[test]
    fn revcomp_() {
        // revcomp(TAGGC) = GCCTA
        let kmer = seq2bit::<u64>(b"TAGGC");
        assert_eq!(kmer2seq(revcomp(kmer, 5), 5), "GCCTA");

        let kmer = seq2bit::<u128>(b"ACTGACTGACTGACTGACTGACTGACTGACTGA");
        assert_eq!(
            kmer2seq(revcomp(kmer, 33), 33),
            "TCAGTCAGTCAGTCAGTCAGTCAGTCAGTCAGT"
        );
    }

    #[test]
    fn comp_() {
        let kmer = seq2bit::<u64>(b"TAGGC");
        assert_eq!(kmer2seq(comp(kmer, 5), 5), "ATCCG");
    }

    #[test]
    fn cannonical_is_idempotent() {
        for seq in [&b"AATGC"[..], b"GCATT", b"TTTTT", b"ACGTA"].iter() {
            let kmer = seq2bit::<u64>(seq);
            let (cano, _) = cannonical(kmer, 5);
            let (again, forward) = cannonical(cano, 5);
            assert_eq!(cano, again);
            assert!(forward);
        }
    }

    #[test]
    fn succ_pred_() {
        let kmer = seq2bit::<u64>(b"AATG");
        assert_eq!(kmer2seq(succ(kmer, 4, nuc2bit(b'C')), 4), "ATGC");
        assert_eq!(kmer2seq(pred(kmer, 4, nuc2bit(b'C')), 4), "CAAT");
    }

    #[test]
    fn prefix_suffix_() {
        let kmer = seq2bit::<u64>(b"AATGC");
        assert_eq!(kmer2seq(prefix(kmer), 4), "AATG");
        assert_eq!(kmer2seq(suffix(kmer, 5), 4), "ATGC");
    }

    #[test]
    fn tokenizer_simple() {
        let tokens: Vec<String> = Tokenizer::<u64>::new(b"AATGC", 4)
            .map(|t| kmer2seq(t.forward, 4))
            .collect();
        assert_eq!(tokens, vec!["AATG".to_string(), "ATGC".to_string()]);
    }

    #[test]
    fn tokenizer_reverse_matches_revcomp() {
        for token in Tokenizer::<u64>::new(b"AGGCGCTAGGGTAGAGGATGATGA", 11) {
            assert_eq!(token.reverse, revcomp(token.forward, 11));
        }
    }

    #[test]
    fn tokenizer_n_break() {
        let tokens: Vec<(String, bool)> = Tokenizer::<u64>::new(b"AATGNCTGAC", 4)
            .map(|t| (kmer2seq(t.forward, 4), t.is_first))
            .collect();
        assert_eq!(
            tokens,
            vec![
                ("AATG".to_string(), true),
                ("CTGA".to_string(), true),
                ("TGAC".to_string(), false)
            ]
        );
    }

    #[test]
    fn tokenizer_short_read() {
        assert_eq!(Tokenizer::<u64>::new(b"AAT", 4).count(), 0);
        assert_eq!(Tokenizer::<u64>::new(b"", 4).count(), 0);
    }

    #[test]
    fn width_buckets() {
        assert!(Width::for_k(1).is_err());
        assert_eq!(Width::for_k(2).unwrap(), Width::W64);
        assert_eq!(Width::for_k(31).unwrap(), Width::W64);
        assert_eq!(Width::for_k(32).unwrap(), Width::W128);
        assert_eq!(Width::for_k(63).unwrap(), Width::W128);
        assert!(Width::for_k(64).is_err());
    }
}
