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

/* local mod */
pub mod union_find;

/* std use */
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/* crate use */
use anyhow::Result;
use log::{debug, info};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

/* local use */
use crate::config::Configuration;
use crate::count::SolidStream;
use crate::error::Error;
use crate::kmer::{self, KmerSpace};
use crate::minimizer::{minimizer_of, MinimizerOrder, Repartition};
use crate::mphf::KmerIndex;
use crate::progress::CancelToken;
use crate::storage::Storage;
use crate::unitig::union_find::UnionFind;

const EMPTY_SLOT: u64 = u64::max_value();

/// Packed per extremity record, unitig id in the high 60 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtremityInfo {
    pub unitig: u64,
    pub deleted: bool,
    /// The cannonical (k-1)-mer appears reverse complemented in the unitig.
    pub rc: bool,
    /// False for the left extremity, true for the right one.
    pub end: bool,
}

impl ExtremityInfo {
    pub fn pack(&self) -> u64 {
        (self.unitig << 3)
            | ((self.deleted as u64) << 2)
            | ((self.rc as u64) << 1)
            | (self.end as u64)
    }

    pub fn unpack(value: u64) -> Self {
        ExtremityInfo {
            unitig: value >> 3,
            deleted: value & 0b100 != 0,
            rc: value & 0b010 != 0,
            end: value & 0b001 != 0,
        }
    }

    /// Leaving the junction through this extremity, orientations aligned.
    fn is_out(&self) -> bool {
        (self.end && !self.rc) || (!self.end && self.rc)
    }

    /// Entering the next unitig through this extremity.
    fn is_in(&self) -> bool {
        (!self.end && !self.rc) || (self.end && self.rc)
    }
}

/* unitig wire format: nt length, 2 bits packed low bits first, tag byte */

fn pack_seq(seq: &[u8], buf: &mut Vec<u8>) {
    buf.clear();
    buf.resize((seq.len() + 3) / 4, 0);
    for (i, nuc) in seq.iter().enumerate() {
        buf[i / 4] |= kmer::nuc2bit(*nuc) << (2 * (i % 4));
    }
}

fn unpack_seq(packed: &[u8], len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| kmer::bit2nuc((packed[i / 4] >> (2 * (i % 4))) & 0b11))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitigRecord {
    pub sequence: Vec<u8>,
    pub circular: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitigLink {
    pub to: u64,
    pub from_reversed: bool,
    pub to_reversed: bool,
}

pub struct UnitigReport {
    pub nb_unitigs: u64,
    pub nb_links: u64,
}

fn complement(nuc: u8) -> u8 {
    match nuc {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        _ => b'C',
    }
}

fn revcomp_seq(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&nuc| complement(nuc)).collect()
}

fn canonical_seq(seq: Vec<u8>) -> Vec<u8> {
    let rc = revcomp_seq(&seq);
    if rc < seq {
        rc
    } else {
        seq
    }
}

/// Cannonical flanking (k-1)-mers and their strand flips.
fn flanks<T: KmerSpace>(x: T, k: u8) -> ((T, bool), (T, bool)) {
    let (left, left_forward) = kmer::cannonical(kmer::prefix(x), k - 1);
    let (right, right_forward) = kmer::cannonical(kmer::suffix(x, k), k - 1);
    ((left, !left_forward), (right, !right_forward))
}

fn pack_slot(idx: u32, is_right: bool) -> u64 {
    ((idx as u64) << 1) | is_right as u64
}

fn read_slot(slots: &[AtomicU64], idx: usize) -> Option<(u32, bool)> {
    let value = slots[idx].load(Ordering::Relaxed);
    if value == EMPTY_SLOT {
        None
    } else {
        Some(((value >> 1) as u32, value & 1 == 1))
    }
}

struct Incidences {
    outs: Vec<(u32, bool)>,
    ins: Vec<(u32, bool)>,
}

impl Default for Incidences {
    fn default() -> Self {
        Incidences {
            outs: Vec::with_capacity(1),
            ins: Vec::with_capacity(1),
        }
    }
}

/// Build maximal non branching paths from the solid set.
///
/// A (k-1)-mer junction belongs to the bucket of its minimizer; every kmer
/// is copied into the owner bucket of each of its two flanks, so one bucket
/// alone sees all the incidences of a junction and decides its gluing. The
/// decisions feed a shared lock free union find and per end partner slots,
/// paths are then reassembled and written with a stable numbering. The
/// result never depends on the number of buckets.
pub fn build<T: KmerSpace>(
    config: &Configuration,
    order: &MinimizerOrder,
    repart: &Repartition,
    storage: &Storage,
    index: &KmerIndex<T>,
    pool: &rayon::ThreadPool,
    cancel: &CancelToken,
) -> Result<UnitigReport> {
    let bcalm = storage.group("bcalm")?;

    let result = build_inner(config, order, repart, storage, index, pool, cancel, &bcalm);
    if result.is_err() {
        let _ = bcalm.set_status(false);
    }
    result
}

fn build_inner<T: KmerSpace>(
    config: &Configuration,
    order: &MinimizerOrder,
    repart: &Repartition,
    storage: &Storage,
    index: &KmerIndex<T>,
    pool: &rayon::ThreadPool,
    cancel: &CancelToken,
    bcalm: &crate::storage::Group,
) -> Result<UnitigReport> {
    let stream = SolidStream::<T>::open(storage)?;
    let k = stream.k();
    let n = index.nb_keys() as usize;

    /* solid kmers laid out by their mphf index */
    let mut kmers: Vec<T> = vec![T::zero(); n];
    let mut placed = 0usize;
    stream.for_each(|kmer, _| {
        kmers[index.index(&kmer) as usize] = kmer;
        placed += 1;
        Ok(())
    })?;
    if placed != n {
        return Err(Error::ConcurrentStateViolation.into());
    }

    info!("glue {} solid kmers over {} buckets", n, config.nb_total_partitions());

    /* phase A: duplicate each kmer into the owner bucket of its flanks */
    let nb_bucket = config.nb_total_partitions();
    let owner = |junction: T| -> usize {
        repart.global_partition_of(minimizer_of(junction, k - 1, order))
    };

    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); nb_bucket];
    for (idx, &x) in kmers.iter().enumerate() {
        let ((left, _), (right, _)) = flanks(x, k);
        let left_bucket = owner(left);
        let right_bucket = owner(right);
        buckets[left_bucket].push(idx as u32);
        if right_bucket != left_bucket {
            buckets[right_bucket].push(idx as u32);
        }
    }

    /* phase B: per bucket gluing through owned junctions */
    let left_slots: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(EMPTY_SLOT)).collect();
    let right_slots: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(EMPTY_SLOT)).collect();
    let uf = UnionFind::new(n as u64);

    pool.install(|| {
        buckets
            .par_iter()
            .enumerate()
            .try_for_each(|(bucket_id, bucket)| -> Result<()> {
                cancel.check()?;

                let mut junctions: FxHashMap<T, Incidences> = FxHashMap::default();
                for &idx in bucket.iter() {
                    let x = kmers[idx as usize];
                    let ((left, left_flip), (right, right_flip)) = flanks(x, k);

                    if owner(left) == bucket_id {
                        let entry = junctions.entry(left).or_default();
                        if left_flip {
                            entry.outs.push((idx, false));
                        } else {
                            entry.ins.push((idx, false));
                        }
                    }
                    if owner(right) == bucket_id {
                        let entry = junctions.entry(right).or_default();
                        if right_flip {
                            entry.ins.push((idx, true));
                        } else {
                            entry.outs.push((idx, true));
                        }
                    }
                }

                for (junction, info) in junctions {
                    /* a palindromic junction has no usable orientation */
                    if junction == kmer::revcomp(junction, k - 1) {
                        continue;
                    }
                    if info.outs.len() != 1 || info.ins.len() != 1 {
                        continue;
                    }

                    let (u, u_right) = info.outs[0];
                    let (v, v_right) = info.ins[0];
                    if u == v {
                        continue;
                    }

                    let u_slots = if u_right { &right_slots } else { &left_slots };
                    let v_slots = if v_right { &right_slots } else { &left_slots };
                    u_slots[u as usize].store(pack_slot(v, v_right), Ordering::Relaxed);
                    v_slots[v as usize].store(pack_slot(u, u_right), Ordering::Relaxed);
                    uf.union(u as u64, v as u64);
                }

                Ok(())
            })
    })?;

    /* phase C: walk the partner slots, one sequence per class */
    let slot = |idx: usize, right: bool| -> Option<(u32, bool)> {
        if right {
            read_slot(&right_slots, idx)
        } else {
            read_slot(&left_slots, idx)
        }
    };

    let oriented_last = |x: T, forward: bool| -> u8 {
        if forward {
            kmer::bit2nuc(x.low_u64() as u8 & 0b11)
        } else {
            kmer::bit2nuc(((x >> (2 * (k - 1) as usize)).low_u64() as u8 & 0b11) ^ 0b10)
        }
    };

    let mut visited = vec![false; n];
    let mut sequences: Vec<(Vec<u8>, bool)> = Vec::new();
    let mut covered = 0usize;

    let walk = |start: usize,
                enter_left: bool,
                circular: bool,
                visited: &mut Vec<bool>|
     -> Vec<u8> {
        let mut seq = if enter_left {
            kmer::kmer2seq(kmers[start], k).into_bytes()
        } else {
            kmer::kmer2seq(kmer::revcomp(kmers[start], k), k).into_bytes()
        };
        visited[start] = true;

        let mut idx = start;
        let mut exit_right = enter_left;
        loop {
            let (next, next_right) = match slot(idx, exit_right) {
                Some(partner) => partner,
                None => break,
            };
            if circular && next as usize == start {
                break;
            }
            if visited[next as usize] {
                break;
            }

            visited[next as usize] = true;
            let forward = !next_right;
            seq.push(oriented_last(kmers[next as usize], forward));
            idx = next as usize;
            exit_right = !next_right;
        }

        seq
    };

    for idx in 0..n {
        if visited[idx] {
            continue;
        }
        let left_free = slot(idx, false).is_none();
        let right_free = slot(idx, true).is_none();
        if !left_free && !right_free {
            continue;
        }

        let seq = walk(idx, left_free, false, &mut visited);
        covered += seq.len() + 1 - k as usize;
        sequences.push((canonical_seq(seq), false));
    }

    /* what remains is circular */
    for idx in 0..n {
        if visited[idx] {
            continue;
        }
        let seq = walk(idx, true, true, &mut visited);
        covered += seq.len() + 1 - k as usize;
        sequences.push((canonical_seq(seq), true));
    }

    /* every solid kmer in exactly one unitig, one unitig per class */
    if covered != n || uf.nb_classes() != sequences.len() as u64 {
        return Err(Error::ConcurrentStateViolation.into());
    }

    let mut writer = bcalm.collection("unitigs").create(0)?;
    let mut packed = Vec::new();
    for (seq, circular) in sequences.iter() {
        writer.write_all(&(seq.len() as u32).to_le_bytes())?;
        pack_seq(seq, &mut packed);
        writer.write_all(&packed)?;
        writer.write_all(&[*circular as u8])?;
    }
    writer.flush()?;

    let mut meta = bcalm.metadata()?;
    meta.set_u64("nb_unitigs", sequences.len() as u64);
    meta.set_u64("kmer_size", k as u64);
    meta.save()?;
    bcalm.set_status(true)?;

    debug!("{} unitigs", sequences.len());

    Ok(UnitigReport {
        nb_unitigs: sequences.len() as u64,
        nb_links: 0,
    })
}

pub fn read_unitigs(storage: &Storage) -> Result<Vec<UnitigRecord>> {
    let bcalm = storage.group("bcalm")?;
    bcalm.ensure_valid()?;

    let collection = bcalm.collection("unitigs");
    let mut reader = collection.open(0)?;
    let path = collection.path().display().to_string();

    let mut records = Vec::new();
    let mut head = [0u8; 4];
    loop {
        if !crate::storage::read_exact_record(&mut reader, &mut head, &path)? {
            break;
        }
        let len = u32::from_le_bytes(head) as usize;

        let mut packed = vec![0u8; (len + 3) / 4];
        if !crate::storage::read_exact_record(&mut reader, &mut packed, &path)? {
            return Err(Error::CorruptPartition { path }.into());
        }
        let mut tag = [0u8; 1];
        if !crate::storage::read_exact_record(&mut reader, &mut tag, &path)? {
            return Err(Error::CorruptPartition { path }.into());
        }

        records.push(UnitigRecord {
            sequence: unpack_seq(&packed, len),
            circular: tag[0] & 1 != 0,
        });
    }

    Ok(records)
}

/// Index both extremities of every unitig then emit directed links between
/// unitigs sharing a (k-1)-mer, orientation from the stored rc bits.
pub fn link_unitigs<T: KmerSpace>(storage: &Storage, k: u8) -> Result<u64> {
    let unitigs = read_unitigs(storage)?;
    let bcalm = storage.group("bcalm")?;

    let mut extremity_index: FxHashMap<T, Vec<ExtremityInfo>> = FxHashMap::default();
    let mut per_unitig: Vec<[(T, ExtremityInfo); 2]> = Vec::with_capacity(unitigs.len());

    for (id, record) in unitigs.iter().enumerate() {
        let seq = &record.sequence;
        let flank = (k - 1) as usize;

        let left: T = kmer::seq2bit(&seq[..flank]);
        let (left_canon, left_forward) = kmer::cannonical(left, k - 1);
        let left_info = ExtremityInfo {
            unitig: id as u64,
            deleted: false,
            rc: !left_forward,
            end: false,
        };

        let right: T = kmer::seq2bit(&seq[seq.len() - flank..]);
        let (right_canon, right_forward) = kmer::cannonical(right, k - 1);
        let right_info = ExtremityInfo {
            unitig: id as u64,
            deleted: false,
            rc: !right_forward,
            end: true,
        };

        extremity_index.entry(left_canon).or_default().push(left_info);
        extremity_index
            .entry(right_canon)
            .or_default()
            .push(right_info);
        per_unitig.push([(left_canon, left_info), (right_canon, right_info)]);
    }

    let mut nb_links = 0u64;
    let mut writer = bcalm.collection("links").create(0)?;
    for (id, extremities) in per_unitig.iter().enumerate() {
        let mut links: Vec<UnitigLink> = Vec::new();

        for (junction, info) in extremities.iter() {
            if let Some(others) = extremity_index.get(junction) {
                for other in others.iter() {
                    if other.unitig == id as u64 && other.end == info.end {
                        continue;
                    }
                    /* an extremity leaves the junction in one orientation
                    and enters it in the other, both give a directed link
                    when the orientations agree */
                    if info.is_out() != other.is_in() {
                        continue;
                    }
                    links.push(UnitigLink {
                        to: other.unitig,
                        from_reversed: !info.end,
                        to_reversed: other.end,
                    });
                }
            }
        }

        links.sort_unstable();
        links.dedup();

        writer.write_all(&[links.len().min(255) as u8])?;
        for link in links.iter().take(255) {
            writer.write_all(&link.to.to_le_bytes())?;
            writer.write_all(&[link.from_reversed as u8 | (link.to_reversed as u8) << 1])?;
        }
        nb_links += links.len() as u64;
    }
    writer.flush()?;

    let mut meta = bcalm.metadata()?;
    meta.set_u64("nb_links", nb_links);
    meta.save()?;

    debug!("{} unitig links", nb_links);

    Ok(nb_links)
}

pub fn read_links(storage: &Storage) -> Result<Vec<Vec<UnitigLink>>> {
    let bcalm = storage.group("bcalm")?;
    bcalm.ensure_valid()?;

    let collection = bcalm.collection("links");
    let mut reader = collection.open(0)?;
    let path = collection.path().display().to_string();

    let mut links = Vec::new();
    let mut count = [0u8; 1];
    loop {
        if !crate::storage::read_exact_record(&mut reader, &mut count, &path)? {
            break;
        }

        let mut per_unitig = Vec::with_capacity(count[0] as usize);
        let mut entry = [0u8; 9];
        for _ in 0..count[0] {
            if !crate::storage::read_exact_record(&mut reader, &mut entry, &path)? {
                return Err(Error::CorruptPartition { path }.into());
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&entry[..8]);
            per_unitig.push(UnitigLink {
                to: u64::from_le_bytes(id),
                from_reversed: entry[8] & 1 != 0,
                to_reversed: entry[8] & 2 != 0,
            });
        }
        links.push(per_unitig);
    }

    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremity_info_pack_roundtrip() {
        for &(unitig, deleted, rc, end) in [
            (0u64, false, false, false),
            (17, true, false, true),
            ((1 << 60) - 1, true, true, true),
        ]
        .iter()
        {
            let info = ExtremityInfo {
                unitig,
                deleted,
                rc,
                end,
            };
            assert_eq!(ExtremityInfo::unpack(info.pack()), info);
        }
    }

    #[test]
    fn out_in_classification() {
        /* forward at the right end leaves the unitig, forward at the left
        end enters it */
        let out = ExtremityInfo {
            unitig: 0,
            deleted: false,
            rc: false,
            end: true,
        };
        assert!(out.is_out() && !out.is_in());

        let into = ExtremityInfo {
            unitig: 0,
            deleted: false,
            rc: false,
            end: false,
        };
        assert!(into.is_in() && !into.is_out());

        /* reverse complement swaps the roles */
        let rc_begin = ExtremityInfo {
            unitig: 0,
            deleted: false,
            rc: true,
            end: false,
        };
        assert!(rc_begin.is_out() && !rc_begin.is_in());
    }

    #[test]
    fn seq_pack_roundtrip() {
        for seq in [&b"A"[..], b"AATGC", b"AGGCGCTAGGGTAGAGGATGATGA"].iter() {
            let mut packed = Vec::new();
            pack_seq(seq, &mut packed);
            assert_eq!(unpack_seq(&packed, seq.len()), seq.to_vec());
        }
    }

    #[test]
    fn canonical_seq_is_min() {
        assert_eq!(canonical_seq(b"AATGC".to_vec()), b"AATGC".to_vec());
        assert_eq!(canonical_seq(b"GCATT".to_vec()), b"AATGC".to_vec());
    }
}
