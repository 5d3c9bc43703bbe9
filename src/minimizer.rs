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

/* std use */
use std::collections::VecDeque;

/* local use */
use crate::kmer;
use crate::kmer::KmerSpace;

pub const MAX_MINIMIZER_SIZE: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerType {
    Lexicographic,
    Frequency,
}

/// Total order on m-mers.
///
/// Lexicographic follow the kmc2 heuristic: m-mers starting with AA or AC are
/// pushed after every other m-mer, so they are picked only when no other
/// candidate exists. Frequency order m-mers by sampled abundance, rarest
/// first, ties broken lexicographically.
pub struct MinimizerOrder {
    m: u8,
    ranks: Option<Vec<u32>>,
}

impl MinimizerOrder {
    pub fn lexicographic(m: u8) -> Self {
        MinimizerOrder { m, ranks: None }
    }

    pub fn frequency(m: u8, freqs: &[u32]) -> Self {
        let mut by_freq: Vec<u32> = (0..(1u32 << (2 * m))).collect();
        by_freq.sort_by_key(|&mmer| (freqs[mmer as usize], mmer));

        let mut ranks = vec![0u32; 1 << (2 * m)];
        for (rank, &mmer) in by_freq.iter().enumerate() {
            ranks[mmer as usize] = rank as u32;
        }

        MinimizerOrder {
            m,
            ranks: Some(ranks),
        }
    }

    pub fn m(&self) -> u8 {
        self.m
    }

    pub fn rank(&self, mmer: u64) -> u64 {
        match &self.ranks {
            Some(ranks) => ranks[mmer as usize] as u64,
            None => {
                if self.forbidden(mmer) {
                    mmer + (1u64 << (2 * self.m))
                } else {
                    mmer
                }
            }
        }
    }

    /* first base A and second base A or C */
    fn forbidden(&self, mmer: u64) -> bool {
        if self.m < 2 {
            return false;
        }
        let first = (mmer >> (2 * (self.m - 1))) & 0b11;
        let second = (mmer >> (2 * (self.m - 2))) & 0b11;
        first == 0b00 && second <= 0b01
    }
}

/// Cannonical m-mer of an m sized window, as a u64.
pub fn canonical_mmer(mmer: u64, m: u8) -> u64 {
    let rc = kmer::revcomp(mmer, m);
    if mmer <= rc {
        mmer
    } else {
        rc
    }
}

/// Smallest cannonical m-mer of all the windows of `x`, a `len` bases kmer.
pub fn minimizer_of<T: KmerSpace>(x: T, len: u8, order: &MinimizerOrder) -> u64 {
    let m = order.m;
    debug_assert!(m <= len);

    let mut best_mmer = 0;
    let mut best_rank = u64::max_value();
    for i in 0..=(len - m) {
        let window = (x >> (2 * i as usize)).low_u64() & kmer::mask::<u64>(m);
        let mmer = canonical_mmer(window, m);
        let rank = order.rank(mmer);
        if rank < best_rank {
            best_rank = rank;
            best_mmer = mmer;
        }
    }

    best_mmer
}

/// Rolling window minimum over cannonical m-mers.
///
/// Monotonic deque keyed by order then insertion position, so the front is
/// always the minimizer of the last `window` inserted m-mers.
pub struct MinimizerRing {
    window: usize,
    deque: VecDeque<(u64, u64, usize)>,
}

impl MinimizerRing {
    pub fn new(window: usize) -> Self {
        MinimizerRing {
            window,
            deque: VecDeque::with_capacity(window),
        }
    }

    pub fn insert(&mut self, rank: u64, mmer: u64, pos: usize) {
        while let Some(front) = self.deque.front() {
            if front.2 + self.window <= pos {
                self.deque.pop_front();
            } else {
                break;
            }
        }

        while let Some(back) = self.deque.back() {
            if back.0 > rank {
                self.deque.pop_back();
            } else {
                break;
            }
        }

        self.deque.push_back((rank, mmer, pos));
    }

    /// Current minimizer value, front of the deque.
    pub fn min(&self) -> Option<u64> {
        self.deque.front().map(|f| f.1)
    }

    pub fn clear(&mut self) {
        self.deque.clear();
    }
}

/// Dense map from minimizer value to (pass, partition) slot.
pub struct Repartition {
    nb_pass: usize,
    nb_partition: usize,
    table: Vec<u32>,
}

impl Repartition {
    /// Round robin over the m-mer order.
    pub fn lexicographic(order: &MinimizerOrder, nb_pass: usize, nb_partition: usize) -> Self {
        let size = 1usize << (2 * order.m());
        let nb_slot = nb_pass * nb_partition;

        let mut table = vec![0u32; size];
        for (mmer, slot) in table.iter_mut().enumerate() {
            *slot = (order.rank(mmer as u64) % nb_slot as u64) as u32;
        }

        Repartition {
            nb_pass,
            nb_partition,
            table,
        }
    }

    /// Balance slots with the sampled minimizer frequency, heaviest minimizer
    /// to the lightest slot.
    pub fn frequency(freqs: &[u32], nb_pass: usize, nb_partition: usize) -> Self {
        let nb_slot = nb_pass * nb_partition;

        let mut by_weight: Vec<u32> = (0..freqs.len() as u32).collect();
        by_weight.sort_by_key(|&mmer| (std::cmp::Reverse(freqs[mmer as usize]), mmer));

        let mut loads = vec![0u64; nb_slot];
        let mut table = vec![0u32; freqs.len()];
        for &mmer in by_weight.iter() {
            let slot = (0..nb_slot)
                .min_by_key(|&s| loads[s])
                .unwrap_or(0);
            loads[slot] += freqs[mmer as usize] as u64 + 1;
            table[mmer as usize] = slot as u32;
        }

        Repartition {
            nb_pass,
            nb_partition,
            table,
        }
    }

    pub fn nb_pass(&self) -> usize {
        self.nb_pass
    }

    pub fn nb_partition(&self) -> usize {
        self.nb_partition
    }

    pub fn pass_of(&self, mmer: u64) -> usize {
        self.table[mmer as usize] as usize / self.nb_partition
    }

    pub fn partition_of(&self, mmer: u64) -> usize {
        self.table[mmer as usize] as usize % self.nb_partition
    }

    /// Partition index in the whole run, all passes laid flat.
    pub fn global_partition_of(&self, mmer: u64) -> usize {
        self.table[mmer as usize] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_rank_demotes_aa_ac() {
        let order = MinimizerOrder::lexicographic(3);

        // AAA and ACA are forbidden, GTT is not
        let aaa = kmer::seq2bit::<u64>(b"AAA");
        let aca = kmer::seq2bit::<u64>(b"ACA");
        let gtt = kmer::seq2bit::<u64>(b"GTT");

        assert!(order.rank(aaa) > order.rank(gtt));
        assert!(order.rank(aca) > order.rank(gtt));
        assert!(order.rank(aaa) < order.rank(aca));
    }

    #[test]
    fn frequency_rank_rarest_first() {
        let mut freqs = vec![10u32; 1 << 6];
        let aga = kmer::seq2bit::<u64>(b"AGA") as usize;
        let ttt = kmer::seq2bit::<u64>(b"TTT") as usize;
        freqs[aga] = 1;
        freqs[ttt] = 100;

        let order = MinimizerOrder::frequency(3, &freqs);
        assert_eq!(order.rank(aga as u64), 0);
        assert_eq!(order.rank(ttt as u64), (1 << 6) - 1);
    }

    #[test]
    fn minimizer_is_strand_invariant() {
        let order = MinimizerOrder::lexicographic(3);
        let kmer7 = kmer::seq2bit::<u64>(b"AGGCGCT");
        let rc = kmer::revcomp(kmer7, 7);

        assert_eq!(
            minimizer_of(kmer7, 7, &order),
            minimizer_of(rc, 7, &order)
        );
    }

    #[test]
    fn ring_follows_window() {
        let order = MinimizerOrder::lexicographic(2);
        let mut ring = MinimizerRing::new(3);

        let values = [10u64, 7, 9, 2, 11, 12, 13];
        let mut mins = Vec::new();
        for (pos, &v) in values.iter().enumerate() {
            ring.insert(order.rank(v), v, pos);
            if pos >= 2 {
                mins.push(ring.min().unwrap());
            }
        }

        assert_eq!(mins, vec![7, 2, 2, 2, 11]);
    }

    #[test]
    fn repartition_covers_all_slots() {
        let order = MinimizerOrder::lexicographic(4);
        let repart = Repartition::lexicographic(&order, 2, 4);

        let mut seen = vec![false; 8];
        for mmer in 0..(1u64 << 8) {
            let slot = repart.pass_of(mmer) * repart.nb_partition() + repart.partition_of(mmer);
            assert_eq!(slot, repart.global_partition_of(mmer));
            seen[slot] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn frequency_repartition_balances() {
        let freqs = vec![1u32; 1 << 6];
        let repart = Repartition::frequency(&freqs, 1, 4);

        let mut loads = vec![0usize; 4];
        for mmer in 0..(1u64 << 6) {
            loads[repart.partition_of(mmer)] += 1;
        }
        for &l in loads.iter() {
            assert_eq!(l, (1 << 6) / 4);
        }
    }
}
