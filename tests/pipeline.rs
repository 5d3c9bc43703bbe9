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
use std::collections::HashMap;
use std::io::Write;

/* crate use */
use comptoir::config::{AbundanceMin, DebloomKind, Options, SolidityKind};
use comptoir::count::SolidStream;
use comptoir::error::Error;
use comptoir::graph::Graph;
use comptoir::kmer;
use comptoir::progress::CancelToken;
use comptoir::unitig;

fn write_fasta(dir: &std::path::Path, name: &str, seqs: &[String]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for (i, seq) in seqs.iter().enumerate() {
        writeln!(file, ">{}\n{}", i, seq).unwrap();
    }
    path
}

fn revcomp_str(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|nuc| match nuc {
            b'A' => 'T',
            b'T' => 'A',
            b'C' => 'G',
            b'G' => 'C',
            other => other as char,
        })
        .collect()
}

/// Sequence orientation order, used for emitted unitigs.
fn canonical_str(seq: &str) -> String {
    let rc = revcomp_str(seq);
    if rc.as_str() < seq {
        rc
    } else {
        seq.to_string()
    }
}

/// Kmer order follows the 2 bits encoding, A < C < T < G.
fn canonical_kmer(seq: &str) -> String {
    let rank = |s: &str| -> Vec<u8> { s.bytes().map(|nuc| (nuc >> 1) & 0b11).collect() };

    let rc = revcomp_str(seq);
    if rank(&rc) < rank(seq) {
        rc
    } else {
        seq.to_string()
    }
}

/// Reference counter: canonical kmer occurrences, restarting over unknown
/// bases.
fn naive_counts(seqs: &[String], k: usize) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for seq in seqs {
        for fragment in seq.split(|c| c != 'A' && c != 'C' && c != 'G' && c != 'T') {
            if fragment.len() < k {
                continue;
            }
            for i in 0..=(fragment.len() - k) {
                *counts
                    .entry(canonical_kmer(&fragment[i..i + k]))
                    .or_insert(0u32) += 1;
            }
        }
    }
    counts
}

fn random_reads(seed: u64, nb: usize, len: usize, with_n: bool) -> Vec<String> {
    let mut state = seed | 1;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    (0..nb)
        .map(|_| {
            (0..len)
                .map(|_| {
                    let draw = next();
                    if with_n && draw % 37 == 0 {
                        'N'
                    } else {
                        ['A', 'C', 'G', 'T'][(draw % 4) as usize]
                    }
                })
                .collect()
        })
        .collect()
}

fn build_graph(
    dir: &std::path::Path,
    seqs: &[String],
    k: u8,
    m: u8,
    nb_cores: usize,
) -> Graph<u64> {
    let path = write_fasta(dir, "reads.fasta", seqs);

    let mut options = Options::new(vec![path], dir.join("graph"), k);
    options.m = m;
    options.abundance_min = AbundanceMin::Fixed(1);
    options.nb_cores = nb_cores;

    Graph::<u64>::create(&options, &CancelToken::new()).unwrap()
}

#[test]
fn every_occurrence_is_counted() {
    /* P1 and P2: the pipeline count matches a naive in memory count */
    let dir = tempfile::tempdir().unwrap();
    let reads = random_reads(42, 30, 120, true);
    let expected = naive_counts(&reads, 9);

    let graph = build_graph(dir.path(), &reads, 9, 5, 2);

    let stream = SolidStream::<u64>::open(graph.storage()).unwrap();
    let mut got = HashMap::new();
    stream
        .for_each(|kmer_value, sum| {
            got.insert(kmer::kmer2seq(kmer_value, 9), sum);
            Ok(())
        })
        .unwrap();

    assert_eq!(got.len(), expected.len());
    for (kmer_string, count) in expected.iter() {
        assert_eq!(got.get(kmer_string), Some(count), "kmer {}", kmer_string);
    }

    let total: u32 = expected.values().sum();
    let meta = graph.storage().group("dsk").unwrap().metadata().unwrap();
    assert_eq!(meta.get_u64("total_kmers"), Some(total as u64));
}

#[test]
fn unitigs_cover_solid_exactly_once() {
    /* P6: kmers of the unitig set are the solid set, multiplicity one */
    let dir = tempfile::tempdir().unwrap();
    let reads = random_reads(1337, 10, 200, false);

    let graph = build_graph(dir.path(), &reads, 13, 7, 2);

    let mut from_unitigs: Vec<String> = Vec::new();
    for record in unitig::read_unitigs(graph.storage()).unwrap() {
        let seq = String::from_utf8(record.sequence).unwrap();
        for i in 0..=(seq.len() - 13) {
            from_unitigs.push(canonical_kmer(&seq[i..i + 13]));
        }
    }
    from_unitigs.sort();

    let mut solid: Vec<String> = naive_counts(&reads, 13).keys().cloned().collect();
    solid.sort();

    assert_eq!(from_unitigs, solid);
}

#[test]
fn partitioning_doesnt_change_unitigs() {
    /* R3: same unitig multiset whatever the partition count */
    let reads = random_reads(7, 20, 150, false);

    let mut all = Vec::new();
    for (nb_cores, m) in [(1usize, 5u8), (8, 5), (8, 9)].iter() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build_graph(dir.path(), &reads, 13, *m, *nb_cores);

        let mut sequences: Vec<String> = unitig::read_unitigs(graph.storage())
            .unwrap()
            .into_iter()
            .map(|record| String::from_utf8(record.sequence).unwrap())
            .collect();
        sequences.sort();
        all.push(sequences);
    }

    assert_eq!(all[0], all[1]);
    assert_eq!(all[0], all[2]);
}

#[test]
fn links_are_exact_overlaps() {
    /* every emitted link is a k-1 overlap in the advertised orientation */
    let dir = tempfile::tempdir().unwrap();
    let reads = vec![
        "CGCTACAGCAGCTAGTTCATCATTGTTTATCAATGATAAAATATAATAAGCTAAAAGGAAACTATAAATA".to_string(),
        "CGCTACAGCAGCTAGTTCATCATTGTTTATCGATGATAAAATATAATAAGCTAAAAGGAAACTATAAATA".to_string(),
    ];
    let k = 15usize;

    let graph = build_graph(dir.path(), &reads, 15, 8, 2);

    let sequences: Vec<String> = unitig::read_unitigs(graph.storage())
        .unwrap()
        .into_iter()
        .map(|record| String::from_utf8(record.sequence).unwrap())
        .collect();
    let links = unitig::read_links(graph.storage()).unwrap();
    assert_eq!(links.len(), sequences.len());

    let mut nb_links = 0;
    for (from, link_list) in links.iter().enumerate() {
        for link in link_list {
            let from_seq = if link.from_reversed {
                revcomp_str(&sequences[from])
            } else {
                sequences[from].clone()
            };
            let to_seq = if link.to_reversed {
                revcomp_str(&sequences[link.to as usize])
            } else {
                sequences[link.to as usize].clone()
            };

            assert_eq!(
                from_seq[from_seq.len() - (k - 1)..],
                to_seq[..k - 1],
                "link {} -> {} isn't an overlap",
                from,
                link.to
            );
            nb_links += 1;
        }
    }

    /* a bubble has four junction sides, each produces links */
    assert!(nb_links >= 6);
}

#[test]
fn smallest_kmer_size() {
    let dir = tempfile::tempdir().unwrap();
    let reads = vec!["ACGT".to_string()];

    let graph = build_graph(dir.path(), &reads, 2, 1, 1);

    /* AC (also covering GT) and the palindromic CG */
    assert_eq!(graph.nb_nodes(), 2);
    assert!(graph.contains(kmer::seq2bit::<u64>(b"AC")));
    assert!(graph.contains(kmer::seq2bit::<u64>(b"CG")));
}

#[test]
fn large_kmer_size_uses_wide_storage() {
    let dir = tempfile::tempdir().unwrap();
    let read = "CGCTACAGCAGCTAGTTCATCATTGTTTATCAATGATAAAATATAATAAGCTAAAAGGAA".to_string();
    let path = write_fasta(dir.path(), "reads.fasta", &[read.clone()]);

    let mut options = Options::new(vec![path], dir.path().join("graph"), 33);
    options.m = 8;
    options.abundance_min = AbundanceMin::Fixed(1);
    options.nb_cores = 2;

    let graph = Graph::<u128>::create(&options, &CancelToken::new()).unwrap();
    assert_eq!(graph.nb_nodes(), (read.len() - 33 + 1) as u64);

    let sequences: Vec<String> = unitig::read_unitigs(graph.storage())
        .unwrap()
        .into_iter()
        .map(|record| String::from_utf8(record.sequence).unwrap())
        .collect();
    assert_eq!(sequences, vec![canonical_str(&read)]);
}

#[test]
fn auto_threshold_drops_singletons() {
    let dir = tempfile::tempdir().unwrap();
    let covered = "AGGCGCTAGGGTAGAGGATGATGA".to_string();
    let noise = "TTTTCTTTTGTTTTATTTTCCTTA".to_string();

    let mut reads = vec![covered.clone(); 5];
    reads.push(noise.clone());
    let path = write_fasta(dir.path(), "reads.fasta", &reads);

    let mut options = Options::new(vec![path], dir.path().join("graph"), 11);
    options.m = 5;
    options.abundance_min = AbundanceMin::Auto;
    options.debloom = DebloomKind::None;
    options.nb_cores = 2;

    let graph = Graph::<u64>::create(&options, &CancelToken::new()).unwrap();

    assert!(graph.contains(kmer::cannonical(kmer::seq2bit::<u64>(b"AGGCGCTAGGG"), 11).0));
    assert!(!graph.contains(kmer::cannonical(kmer::seq2bit::<u64>(b"TTTTCTTTTGT"), 11).0));
    assert_eq!(graph.nb_nodes(), 14);
}

#[test]
fn all_banks_solidity() {
    let dir = tempfile::tempdir().unwrap();
    let shared = "AGGCGCTAGGGTAGAGGATGATGA".to_string();
    let only_first = "TTTTCTTTTGTTTTATTTTCCTTA".to_string();

    let bank_a = write_fasta(dir.path(), "a.fasta", &[shared.clone(), only_first.clone()]);
    let bank_b = write_fasta(dir.path(), "b.fasta", &[shared.clone()]);

    let mut options = Options::new(vec![bank_a, bank_b], dir.path().join("graph"), 11);
    options.m = 5;
    options.abundance_min = AbundanceMin::Fixed(1);
    options.solidity = SolidityKind::All;
    options.debloom = DebloomKind::None;
    options.nb_cores = 2;

    let graph = Graph::<u64>::create(&options, &CancelToken::new()).unwrap();

    /* kmers seen in every bank are solid, single bank ones are not */
    assert!(graph.contains(kmer::cannonical(kmer::seq2bit::<u64>(b"AGGCGCTAGGG"), 11).0));
    assert!(!graph.contains(kmer::cannonical(kmer::seq2bit::<u64>(b"TTTTCTTTTGT"), 11).0));
    assert_eq!(graph.nb_nodes(), 14);
}

#[test]
fn cancellation_flags_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let reads = random_reads(5, 5, 100, false);
    let path = write_fasta(dir.path(), "reads.fasta", &reads);

    let mut options = Options::new(vec![path], dir.path().join("graph"), 11);
    options.m = 5;
    options.nb_cores = 1;

    let cancel = CancelToken::new();
    cancel.cancel();

    let error = Graph::<u64>::create(&options, &cancel).unwrap_err();
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::Cancelled)
    ));

    /* the partial output refuses to reopen */
    assert!(SolidStream::<u64>::open(
        &comptoir::storage::Storage::open(dir.path().join("graph")).unwrap()
    )
    .is_err());
}
