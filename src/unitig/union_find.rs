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
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock free union find shared between gluing workers.
///
/// Parent updates are single word compare and swap, path halving keeps the
/// trees flat. The smallest member index always wins the root, so roots are
/// deterministic whatever the thread interleaving.
pub struct UnionFind {
    parent: Vec<AtomicU64>,
}

impl UnionFind {
    pub fn new(len: u64) -> Self {
        UnionFind {
            parent: (0..len).map(AtomicU64::new).collect(),
        }
    }

    pub fn len(&self) -> u64 {
        self.parent.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&self, mut x: u64) -> u64 {
        loop {
            let p = self.parent[x as usize].load(Ordering::Relaxed);
            if p == x {
                return x;
            }

            let gp = self.parent[p as usize].load(Ordering::Relaxed);
            /* advisory halving, losing the race only costs a retry */
            let _ = self.parent[x as usize].compare_exchange_weak(
                p,
                gp,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            x = gp;
        }
    }

    pub fn union(&self, a: u64, b: u64) {
        loop {
            let ra = self.find(a);
            let rb = self.find(b);
            if ra == rb {
                return;
            }

            let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
            if self.parent[high as usize]
                .compare_exchange(high, low, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn same(&self, a: u64, b: u64) -> bool {
        /* racy in the middle of a union, callers only use it after joins */
        self.find(a) == self.find(b)
    }

    pub fn nb_classes(&self) -> u64 {
        (0..self.len()).filter(|&x| self.find(x) == x).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_find() {
        let uf = UnionFind::new(10);
        assert_eq!(uf.nb_classes(), 10);

        uf.union(1, 3);
        uf.union(3, 5);
        uf.union(8, 9);

        assert!(uf.same(1, 5));
        assert!(uf.same(8, 9));
        assert!(!uf.same(1, 8));
        assert_eq!(uf.nb_classes(), 7);

        /* smallest member is the root */
        assert_eq!(uf.find(5), 1);
        assert_eq!(uf.find(9), 8);
    }

    #[test]
    fn concurrent_unions_converge() {
        use std::sync::Arc;

        let uf = Arc::new(UnionFind::new(1000));
        let mut handles = Vec::new();
        for t in 0..4 {
            let uf = uf.clone();
            handles.push(std::thread::spawn(move || {
                for i in (t..999).step_by(4) {
                    uf.union(i as u64, i as u64 + 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        /* everything chained into one class rooted at 0 */
        assert_eq!(uf.nb_classes(), 1);
        for x in 0..1000 {
            assert_eq!(uf.find(x), 0);
        }
    }
}
