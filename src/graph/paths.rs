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

/* local use */
use crate::graph::{Direction, Graph, Node};
use crate::kmer::KmerSpace;

/// Walk simple nodes away from a start node.
///
/// Stops before a branch, a dead end, or a node whose opposite direction
/// degree exceeds one: every yielded node is internal to a simple path, its
/// total degree is two.
pub struct SimplePathIterator<'a, T> {
    graph: &'a Graph<T>,
    current: Node<T>,
    direction: Direction,
    stopped: bool,
}

impl<'a, T: KmerSpace> SimplePathIterator<'a, T> {
    pub fn new(graph: &'a Graph<T>, start: Node<T>, direction: Direction) -> Self {
        SimplePathIterator {
            graph,
            current: start,
            direction,
            stopped: false,
        }
    }
}

impl<'a, T: KmerSpace> Iterator for SimplePathIterator<'a, T> {
    type Item = Node<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }

        let neighbours = self.graph.neighbours_with_label(self.current, self.direction);
        if neighbours.len() != 1 {
            self.stopped = true;
            return None;
        }

        let (_, next) = neighbours[0];
        if self.graph.degree(next, self.direction.opposite()) != 1 {
            self.stopped = true;
            return None;
        }

        self.current = next;
        Some(next)
    }
}

/// Edge between two branching nodes, the distance counts the simple nodes
/// in between.
#[derive(Debug, Clone, Copy)]
pub struct BranchingEdge<T> {
    pub from: Node<T>,
    pub to: Node<T>,
    pub nucleotide: u8,
    pub distance: usize,
}

impl<T: KmerSpace> Graph<T> {
    pub fn simple_path(&self, start: Node<T>, direction: Direction) -> SimplePathIterator<T> {
        SimplePathIterator::new(self, start, direction)
    }

    /// Follow each branch until the next branching node.
    pub fn branching_neighbours(
        &self,
        node: Node<T>,
        direction: Direction,
    ) -> Vec<BranchingEdge<T>> {
        let mut edges = Vec::new();

        for (nucleotide, neighbour) in self.neighbours_with_label(node, direction) {
            let mut distance = 0usize;
            let mut current = neighbour;
            /* a pure simple cycle would loop forever */
            let mut budget = self.nb_nodes() + 1;

            loop {
                if self.is_branching(current) {
                    edges.push(BranchingEdge {
                        from: node,
                        to: current,
                        nucleotide,
                        distance,
                    });
                    break;
                }

                let next = self.neighbours_with_label(current, direction);
                if next.len() != 1 || budget == 0 {
                    break;
                }
                budget -= 1;
                distance += 1;
                current = next[0].1;
            }
        }

        edges
    }
}
