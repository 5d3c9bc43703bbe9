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
pub mod paths;

/* std use */
use std::path::Path;

/* crate use */
use anyhow::Result;
use log::info;

/* local use */
use crate::config::Options;
use crate::count::{self, SolidStream};
use crate::debloom::{self, Membership};
use crate::error::Error;
use crate::kmer::{self, KmerSpace};
use crate::mphf::KmerIndex;
use crate::partitioner;
use crate::progress::{CancelToken, NoProgress, Progress};
use crate::storage::Storage;
use crate::unitig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }
}

/// A graph node: a cannonical kmer plus the strand it is looked at from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node<T> {
    pub kmer: T,
    pub strand: Strand,
}

impl<T: KmerSpace> Node<T> {
    pub fn oriented(&self, k: u8) -> T {
        match self.strand {
            Strand::Forward => self.kmer,
            Strand::Reverse => kmer::revcomp(self.kmer, k),
        }
    }

    pub fn reverse(self) -> Node<T> {
        Node {
            kmer: self.kmer,
            strand: match self.strand {
                Strand::Forward => Strand::Reverse,
                Strand::Reverse => Strand::Forward,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Edge<T> {
    pub from: Node<T>,
    pub to: Node<T>,
    pub nucleotide: u8,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphInfo {
    pub k: u8,
    pub nb_nodes: u64,
    pub abundance_min: u16,
}

/// Compacted de Bruijn graph facade.
///
/// Node membership goes through the bloom and critical false positive
/// structure, annotations through the minimal perfect hash. Every query is
/// constant time.
#[derive(Debug)]
pub struct Graph<T> {
    storage: Storage,
    k: u8,
    membership: Membership<T>,
    index: KmerIndex<T>,
    nb_nodes: u64,
    abundance_min: u16,
}

impl<T: KmerSpace> Graph<T> {
    /// Run the whole build pipeline: partition, count, debloom, index,
    /// compact, link. The storage root then holds every artefact.
    pub fn create(options: &Options, cancel: &CancelToken) -> Result<Graph<T>> {
        Self::create_with_progress(options, cancel, &NoProgress)
    }

    pub fn create_with_progress(
        options: &Options,
        cancel: &CancelToken,
        progress: &dyn Progress,
    ) -> Result<Graph<T>> {
        options.validate()?;
        if options.k > T::MAX_K {
            return Err(Error::InvalidInput {
                message: format!("kmer size {} doesn't fit this kmer width", options.k),
            }
            .into());
        }

        let estimate = partitioner::estimate(options)?;
        let config = crate::config::configure(options, &estimate)?;
        info!(
            "configuration: {} passes, {} partitions, {} cores",
            config.nb_passes, config.nb_partitions, config.nb_cores
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.nb_cores)
            .build()?;

        let (order, repart) = partitioner::build_repartition(options, &config)?;
        let storage = Storage::create(&options.output)?;

        info!("begin kmer counting");
        count::count_all::<T>(
            options, &config, &order, &repart, &storage, &pool, cancel, progress,
        )?;
        info!("end kmer counting");

        info!("begin membership construction");
        let membership = debloom::build::<T>(options, &storage, &pool)?;
        debloom::save(&membership, &storage, options.k)?;
        info!("end membership construction");

        info!("begin kmer indexing");
        let index = KmerIndex::<T>::build(&storage)?;
        index.save(&storage, options.k)?;
        info!("end kmer indexing");

        info!("begin unitig construction");
        unitig::build::<T>(&config, &order, &repart, &storage, &index, &pool, cancel)?;
        unitig::link_unitigs::<T>(&storage, options.k)?;
        info!("end unitig construction");

        let meta = storage.group("dsk")?.metadata()?;
        let nb_nodes = meta.get_u64("nb_solid").unwrap_or(0);
        let abundance_min = meta.require_u64("abundance_min")? as u16;

        Ok(Graph {
            storage,
            k: options.k,
            membership,
            index,
            nb_nodes,
            abundance_min,
        })
    }

    /// Reopen a finished build.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Graph<T>> {
        let storage = Storage::open(root)?;

        let dsk = storage.group("dsk")?;
        dsk.ensure_valid()?;
        let meta = dsk.metadata()?;
        let k = meta.require_u64("kmer_size")? as u8;
        if k > T::MAX_K {
            return Err(Error::SchemaMismatch {
                path: storage.root().display().to_string(),
                message: format!("kmer size {} doesn't fit this kmer width", k),
            }
            .into());
        }

        let nb_nodes = meta.get_u64("nb_solid").unwrap_or(0);
        let abundance_min = meta.require_u64("abundance_min")? as u16;

        let membership = debloom::load::<T>(&storage)?;
        let index = KmerIndex::<T>::load(&storage, k)?;

        Ok(Graph {
            storage,
            k,
            membership,
            index,
            nb_nodes,
            abundance_min,
        })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn info(&self) -> GraphInfo {
        GraphInfo {
            k: self.k,
            nb_nodes: self.nb_nodes,
            abundance_min: self.abundance_min,
        }
    }

    /// Membership of a cannonical kmer, deletion aware.
    pub fn contains(&self, cannonical: T) -> bool {
        self.membership.contains(cannonical)
            && !self.index.is_deleted_at(self.index.index(&cannonical))
    }

    /// Node from any kmer value, cannonicalised.
    pub fn node(&self, any_strand: T) -> Node<T> {
        let (cannonical, forward) = kmer::cannonical(any_strand, self.k);
        Node {
            kmer: cannonical,
            strand: if forward {
                Strand::Forward
            } else {
                Strand::Reverse
            },
        }
    }

    /// Node of the first kmer of a sequence.
    pub fn build_node(&self, seq: &[u8]) -> Result<Node<T>> {
        if seq.len() < self.k as usize {
            return Err(Error::InvalidInput {
                message: format!("sequence shorter than k = {}", self.k),
            }
            .into());
        }
        let window = &seq[..self.k as usize];
        if window.iter().any(|&nuc| !kmer::valid_nuc(nuc)) {
            return Err(Error::InvalidInput {
                message: "sequence contains an unknown base".to_string(),
            }
            .into());
        }

        Ok(self.node(kmer::seq2bit(window)))
    }

    /// Neighbours with their edge label, at most four.
    pub fn neighbours_with_label(&self, node: Node<T>, direction: Direction) -> Vec<(u8, Node<T>)> {
        let oriented = node.oriented(self.k);
        let mut out = Vec::with_capacity(4);

        for bit in 0..4u8 {
            let next = match direction {
                Direction::Outgoing => kmer::succ(oriented, self.k, bit),
                Direction::Incoming => kmer::pred(oriented, self.k, bit),
            };
            let (cannonical, forward) = kmer::cannonical(next, self.k);
            if self.contains(cannonical) {
                out.push((
                    kmer::bit2nuc(bit),
                    Node {
                        kmer: cannonical,
                        strand: if forward {
                            Strand::Forward
                        } else {
                            Strand::Reverse
                        },
                    },
                ));
            }
        }

        out
    }

    pub fn edges(&self, node: Node<T>, direction: Direction) -> Vec<Edge<T>> {
        self.neighbours_with_label(node, direction)
            .into_iter()
            .map(|(nucleotide, to)| Edge {
                from: node,
                to,
                nucleotide,
                direction,
            })
            .collect()
    }

    pub fn successors(&self, node: Node<T>) -> Vec<Node<T>> {
        self.neighbours_with_label(node, Direction::Outgoing)
            .into_iter()
            .map(|(_, n)| n)
            .collect()
    }

    pub fn predecessors(&self, node: Node<T>) -> Vec<Node<T>> {
        self.neighbours_with_label(node, Direction::Incoming)
            .into_iter()
            .map(|(_, n)| n)
            .collect()
    }

    /// One neighbour along one labelled edge, `None` when it doesn't exist.
    pub fn neighbour(&self, node: Node<T>, direction: Direction, nucleotide: u8) -> Option<Node<T>> {
        let oriented = node.oriented(self.k);
        let bit = kmer::nuc2bit(nucleotide);
        let next = match direction {
            Direction::Outgoing => kmer::succ(oriented, self.k, bit),
            Direction::Incoming => kmer::pred(oriented, self.k, bit),
        };
        let (cannonical, forward) = kmer::cannonical(next, self.k);
        if self.contains(cannonical) {
            Some(Node {
                kmer: cannonical,
                strand: if forward {
                    Strand::Forward
                } else {
                    Strand::Reverse
                },
            })
        } else {
            None
        }
    }

    pub fn degree(&self, node: Node<T>, direction: Direction) -> usize {
        self.neighbours_with_label(node, direction).len()
    }

    pub fn is_branching(&self, node: Node<T>) -> bool {
        self.degree(node, Direction::Incoming) != 1 || self.degree(node, Direction::Outgoing) != 1
    }

    pub fn abundance(&self, node: Node<T>) -> u8 {
        self.index.abundance(&node.kmer)
    }

    /// Deletion flips the mphf bit, `contains` answers false afterwards.
    pub fn delete(&self, node: Node<T>) {
        self.index.delete(&node.kmer);
    }

    pub fn undelete(&self, node: Node<T>) {
        self.index.undelete(&node.kmer);
    }

    pub fn nb_nodes(&self) -> u64 {
        self.nb_nodes
    }

    /// Every live node, forward strand, in partition order.
    pub fn for_each_node<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Node<T>) -> Result<()>,
    {
        let stream = SolidStream::<T>::open(&self.storage)?;
        stream.for_each(|cannonical, _| {
            if !self.index.is_deleted_at(self.index.index(&cannonical)) {
                f(Node {
                    kmer: cannonical,
                    strand: Strand::Forward,
                })?;
            }
            Ok(())
        })
    }

    /// Real forks and joins. Dead ends stop paths and answer true to
    /// `is_branching` but aren't reported here.
    pub fn is_fork_or_join(&self, node: Node<T>) -> bool {
        self.degree(node, Direction::Incoming) > 1 || self.degree(node, Direction::Outgoing) > 1
    }

    pub fn branching_nodes(&self) -> Result<Vec<Node<T>>> {
        let mut nodes = Vec::new();
        self.for_each_node(|node| {
            if self.is_fork_or_join(node) {
                nodes.push(node);
            }
            Ok(())
        })?;
        Ok(nodes)
    }

    pub fn count_branching(&self) -> Result<u64> {
        let mut count = 0;
        self.for_each_node(|node| {
            if self.is_fork_or_join(node) {
                count += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }
}

/// Batch deletion helper for external simplification passes: mark freely,
/// apply once.
pub struct NodesDeleter<T> {
    pending: Vec<T>,
}

impl<T: KmerSpace> NodesDeleter<T> {
    pub fn new() -> Self {
        NodesDeleter {
            pending: Vec::new(),
        }
    }

    pub fn mark(&mut self, node: Node<T>) {
        self.pending.push(node.kmer);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn apply(self, graph: &Graph<T>) {
        for cannonical in self.pending {
            graph.index.delete(&cannonical);
        }
    }
}

impl<T: KmerSpace> Default for NodesDeleter<T> {
    fn default() -> Self {
        Self::new()
    }
}
