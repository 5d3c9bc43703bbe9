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
use std::sync::{Arc, Mutex};

/* crate use */
use anyhow::Result;

/* local use */
use crate::config::SolidityKind;
use crate::count::histogram::Histogram;
use crate::error::Error;
use crate::kmer::KmerSpace;
use crate::storage::cache::CacheWriter;

/// One stage of the per partition count stream.
///
/// Counts arrive in strictly ascending cannonical kmer order within a
/// partition. A stage returning false drops the record for every later
/// stage. One chain instance exists per partition, shared state is merged at
/// `end_part`.
pub trait CountProcessor<T>: Send {
    fn begin_part(&mut self, _pass: usize, _part: usize) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, part: usize, kmer: T, counts: &[u16], sum: u32) -> Result<bool>;

    fn end_part(&mut self, _pass: usize, _part: usize) -> Result<()> {
        Ok(())
    }
}

pub struct ProcessorChain<'a, T> {
    items: Vec<Box<dyn CountProcessor<T> + 'a>>,
}

impl<'a, T: KmerSpace> ProcessorChain<'a, T> {
    pub fn new(items: Vec<Box<dyn CountProcessor<T> + 'a>>) -> Self {
        ProcessorChain { items }
    }

    pub fn begin_part(&mut self, pass: usize, part: usize) -> Result<()> {
        for item in self.items.iter_mut() {
            item.begin_part(pass, part)?;
        }
        Ok(())
    }

    pub fn process(&mut self, part: usize, kmer: T, counts: &[u16], sum: u32) -> Result<()> {
        for item in self.items.iter_mut() {
            if !item.process(part, kmer, counts, sum)? {
                break;
            }
        }
        Ok(())
    }

    pub fn end_part(&mut self, pass: usize, part: usize) -> Result<()> {
        for item in self.items.iter_mut() {
            item.end_part(pass, part)?;
        }
        Ok(())
    }
}

/// Does this abundance vector pass the user predicate.
pub fn is_solid(kind: SolidityKind, min: u16, max: u16, counts: &[u16], sum: u32) -> bool {
    let in_range = |count: u32| count >= min as u32 && count <= max as u32;

    match kind {
        SolidityKind::Sum => in_range(sum),
        SolidityKind::All => counts.iter().all(|&c| in_range(c as u32)),
        SolidityKind::One => counts.iter().any(|&c| in_range(c as u32)),
    }
}

pub struct SolidityGate {
    kind: SolidityKind,
    min: u16,
    max: u16,
}

impl SolidityGate {
    pub fn new(kind: SolidityKind, min: u16, max: u16) -> Self {
        SolidityGate { kind, min, max }
    }
}

impl<T: KmerSpace> CountProcessor<T> for SolidityGate {
    fn process(&mut self, _part: usize, _kmer: T, counts: &[u16], sum: u32) -> Result<bool> {
        Ok(is_solid(self.kind, self.min, self.max, counts, sum))
    }
}

/// Aggregates every abundance, before any gate, into the shared histogram.
pub struct HistogramProcessor {
    local: Histogram,
    shared: Arc<Mutex<Histogram>>,
    total_kmers: Arc<AtomicU64>,
}

impl HistogramProcessor {
    pub fn new(shared: Arc<Mutex<Histogram>>, total_kmers: Arc<AtomicU64>) -> Self {
        HistogramProcessor {
            local: Histogram::default(),
            shared,
            total_kmers,
        }
    }
}

impl<T: KmerSpace> CountProcessor<T> for HistogramProcessor {
    fn process(&mut self, _part: usize, _kmer: T, _counts: &[u16], sum: u32) -> Result<bool> {
        self.local.inc(sum);
        self.total_kmers.fetch_add(sum as u64, Ordering::Relaxed);
        Ok(true)
    }

    fn end_part(&mut self, _pass: usize, _part: usize) -> Result<()> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| Error::ConcurrentStateViolation)?;
        shared.merge(&self.local);
        self.local = Histogram::default();
        Ok(())
    }
}

/* count record wire format: kmer bytes then one u16 per bank */

pub fn encode_count<T: KmerSpace>(kmer: T, counts: &[u16], kmer_bytes: usize, buf: &mut Vec<u8>) {
    buf.clear();
    buf.resize(kmer_bytes, 0);
    kmer.write_le(&mut buf[..kmer_bytes]);
    for count in counts {
        buf.extend_from_slice(&count.to_le_bytes());
    }
}

pub fn count_record_size(k: u8, nb_banks: usize) -> usize {
    crate::kmer::bytes_per_kmer(k) + 2 * nb_banks
}

/// Writes surviving records into the matching output partition, keeping the
/// per partition sorted order.
pub struct DumpProcessor<'a, T> {
    cache: CacheWriter<'a>,
    kmer_bytes: usize,
    scratch: Vec<u8>,
    nb_written: Arc<AtomicU64>,
    phantom: std::marker::PhantomData<T>,
}

impl<'a, T: KmerSpace> DumpProcessor<'a, T> {
    pub fn new(cache: CacheWriter<'a>, k: u8, nb_written: Arc<AtomicU64>) -> Self {
        DumpProcessor {
            cache,
            kmer_bytes: crate::kmer::bytes_per_kmer(k),
            scratch: Vec::new(),
            nb_written,
            phantom: std::marker::PhantomData,
        }
    }
}

impl<'a, T: KmerSpace> CountProcessor<T> for DumpProcessor<'a, T> {
    fn process(&mut self, _part: usize, kmer: T, counts: &[u16], _sum: u32) -> Result<bool> {
        encode_count(kmer, counts, self.kmer_bytes, &mut self.scratch);
        self.cache.write_record(&self.scratch)?;
        self.nb_written.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn end_part(&mut self, _pass: usize, _part: usize) -> Result<()> {
        self.cache.flush()
    }
}
