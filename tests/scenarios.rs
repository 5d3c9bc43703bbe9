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
use std::io::Write;

/* crate use */
use comptoir::config::{AbundanceMin, Options};
use comptoir::graph::{Direction, Graph};
use comptoir::kmer;
use comptoir::progress::CancelToken;
use comptoir::unitig;

fn write_fasta(dir: &std::path::Path, seqs: &[&str]) -> std::path::PathBuf {
    let path = dir.join("reads.fasta");
    let mut file = std::fs::File::create(&path).unwrap();
    for (i, seq) in seqs.iter().enumerate() {
        writeln!(file, ">{}\n{}", i, seq).unwrap();
    }
    path
}

fn build(
    dir: &std::path::Path,
    seqs: &[&str],
    k: u8,
    m: u8,
    abundance_min: u16,
) -> Graph<u64> {
    let path = write_fasta(dir, seqs);

    let mut options = Options::new(vec![path], dir.join("graph"), k);
    options.m = m;
    options.abundance_min = AbundanceMin::Fixed(abundance_min);
    options.nb_cores = 2;

    Graph::<u64>::create(&options, &CancelToken::new()).unwrap()
}

fn unitig_sequences(graph: &Graph<u64>) -> Vec<String> {
    let mut sequences: Vec<String> = unitig::read_unitigs(graph.storage())
        .unwrap()
        .into_iter()
        .map(|record| String::from_utf8(record.sequence).unwrap())
        .collect();
    sequences.sort();
    sequences
}

#[test]
fn single_read_two_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(dir.path(), &["AATGC"], 4, 3, 1);

    assert_eq!(graph.nb_nodes(), 2);

    let aatg = graph.build_node(b"AATGC").unwrap();
    let successors = graph.successors(aatg);
    assert_eq!(successors.len(), 1);
    assert_eq!(successors[0].kmer, kmer::seq2bit::<u64>(b"ATGC"));

    let atgc = graph.node(kmer::seq2bit::<u64>(b"ATGC"));
    let predecessors = graph.predecessors(atgc);
    assert_eq!(predecessors.len(), 1);
    assert_eq!(predecessors[0].kmer, kmer::seq2bit::<u64>(b"AATG"));

    assert_eq!(unitig_sequences(&graph), vec!["AATGC".to_string()]);
}

#[test]
fn duplicated_read_abundance_two() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(dir.path(), &["AATGC", "AATGC"], 4, 3, 2);

    assert_eq!(graph.nb_nodes(), 2);
    assert_eq!(
        graph.abundance(graph.node(kmer::seq2bit::<u64>(b"AATG"))),
        2
    );
    assert_eq!(
        graph.abundance(graph.node(kmer::seq2bit::<u64>(b"ATGC"))),
        2
    );
    assert_eq!(unitig_sequences(&graph), vec!["AATGC".to_string()]);
}

#[test]
fn threshold_above_everything() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(dir.path(), &["AATGC", "AATGC"], 4, 3, 3);

    assert_eq!(graph.nb_nodes(), 0);
    assert!(unitig_sequences(&graph).is_empty());
    assert!(!graph.contains(kmer::seq2bit::<u64>(b"AATG")));
}

#[test]
fn linear_read_single_unitig() {
    let dir = tempfile::tempdir().unwrap();
    let read = "AGGCGCTAGGGTAGAGGATGATGA";
    let graph = build(dir.path(), &[read], 11, 5, 1);

    assert_eq!(graph.nb_nodes(), 14);
    assert_eq!(graph.count_branching().unwrap(), 0);
    assert_eq!(unitig_sequences(&graph), vec![read.to_string()]);
}

#[test]
fn three_way_branch() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(
        dir.path(),
        &[
            "AGGCGCTAGGGAGAGGATGATGAAA",
            "AGGCGCTCGGGAGAGGATGATGAAA",
            "AGGCGCTTGGGAGAGGATGATGAAA",
        ],
        7,
        5,
        1,
    );

    let fork = graph.node(kmer::seq2bit::<u64>(b"AGGCGCT"));
    assert_eq!(graph.degree(fork, Direction::Outgoing), 3);
    assert!(graph.is_branching(fork));

    let join = graph.node(kmer::seq2bit::<u64>(b"GGGAGAG"));
    let edges = graph.branching_neighbours(fork, Direction::Outgoing);
    assert_eq!(edges.len(), 3);
    for edge in edges.iter() {
        assert_eq!(edge.to.kmer, join.kmer);
        assert_eq!(edge.distance, 7);
    }

    /* shared 7 bases prefix, three branches, shared suffix */
    assert_eq!(
        unitig_sequences(&graph),
        vec![
            "AGCGCCT".to_string(),
            "GGCGCTAGGGAGA".to_string(),
            "GGCGCTCGGGAGA".to_string(),
            "GGCGCTTGGGAGA".to_string(),
            "GGGAGAGGATGATGAAA".to_string(),
        ]
    );
}

#[test]
fn snp_bubble() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(
        dir.path(),
        &[
            "CGCTACAGCAGCTAGTTCATCATTGTTTATCAATGATAAAATATAATAAGCTAAAAGGAAACTATAAATA",
            "CGCTACAGCAGCTAGTTCATCATTGTTTATCGATGATAAAATATAATAAGCTAAAAGGAAACTATAAATA",
        ],
        15,
        8,
        1,
    );

    assert_eq!(graph.nb_nodes(), 71);

    /* the divergence opens two arms, the convergence closes them */
    let divergence = graph.node(kmer::seq2bit::<u64>(b"TCATCATTGTTTATC"));
    assert!(graph.is_branching(divergence));
    assert_eq!(graph.degree(divergence, Direction::Outgoing), 2);

    let convergence = graph.node(kmer::seq2bit::<u64>(b"ATGATAAAATATAAT"));
    assert!(graph.is_branching(convergence));
    assert_eq!(graph.degree(convergence, Direction::Incoming), 2);

    /* shared prefix, two bubble arms, shared suffix */
    let sequences = unitig_sequences(&graph);
    let mut lengths: Vec<usize> = sequences.iter().map(|s| s.len()).collect();
    lengths.sort_unstable();
    assert_eq!(lengths, vec![29, 29, 31, 38]);

    /* both arms differ only by the variant base */
    let arms: Vec<&String> = sequences.iter().filter(|s| s.len() == 29).collect();
    assert_eq!(arms.len(), 2);
    let diff = arms[0]
        .bytes()
        .zip(arms[1].bytes())
        .filter(|(a, b)| a != b)
        .count();
    assert_eq!(diff, 1);
}

#[test]
fn simple_path_stops_at_branch() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(
        dir.path(),
        &[
            "AGGCGCTAGGGAGAGGATGATGAAA",
            "AGGCGCTCGGGAGAGGATGATGAAA",
            "AGGCGCTTGGGAGAGGATGATGAAA",
        ],
        7,
        5,
        1,
    );

    /* from the first kmer of one arm, the simple path runs to the kmer
    before the join then stops */
    let start = graph.node(kmer::seq2bit::<u64>(b"GGCGCTA"));
    let path: Vec<_> = graph.simple_path(start, Direction::Outgoing).collect();
    assert_eq!(path.len(), 6);

    let join = graph.node(kmer::seq2bit::<u64>(b"GGGAGAG"));
    assert!(path.iter().all(|node| node.kmer != join.kmer));
}

#[test]
fn deletion_hides_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let graph = build(dir.path(), &["AATGC"], 4, 3, 1);

    let node = graph.node(kmer::seq2bit::<u64>(b"AATG"));
    assert!(graph.contains(node.kmer));

    graph.delete(node);
    assert!(!graph.contains(node.kmer));
    assert!(graph.successors(node).is_empty() || !graph.contains(node.kmer));

    let atgc = graph.node(kmer::seq2bit::<u64>(b"ATGC"));
    assert!(graph.predecessors(atgc).is_empty());

    graph.undelete(node);
    assert!(graph.contains(node.kmer));
    assert_eq!(graph.predecessors(atgc).len(), 1);
}
