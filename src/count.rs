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
pub mod histogram;
pub mod processor;

/* std use */
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/* crate use */
use anyhow::Result;
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;

/* local use */
use crate::config::{
    AbundanceMin, Configuration, Options, PartitionType, SolidityKind,
};
use crate::count::histogram::Histogram;
use crate::count::processor::{
    count_record_size, is_solid, DumpProcessor, HistogramProcessor, ProcessorChain, SolidityGate,
};
use crate::error::Error;
use crate::kmer::{self, KmerSpace, Tokenizer};
use crate::minimizer::{MinimizerOrder, Repartition};
use crate::partitioner::{self, SuperkmerReader};
use crate::progress::{CancelToken, Progress};
use crate::storage::{PartitionSet, Storage};

const HASH_LOAD_PERCENT: usize = 70;
const KMERS_PER_SUPERKMER_HINT: u64 = 4;

/// Open addressing counter, used when the partition comfortably fits the
/// memory budget. Empty slots hold the maximal integer, which no kmer of a
/// supported size can reach.
struct HashCounter<T> {
    keys: Vec<T>,
    counts: Vec<u16>,
    nb_banks: usize,
    mask: usize,
    occupied: usize,
    limit: usize,
}

impl<T: KmerSpace> HashCounter<T> {
    fn with_capacity(expected: u64, nb_banks: usize, memory_limit: usize) -> Option<Self> {
        let capacity = (2 * expected).max(1024).next_power_of_two() as usize;
        let entry_bytes = std::mem::size_of::<T>() + 2 * nb_banks;
        if capacity * entry_bytes > memory_limit {
            return None;
        }

        Some(HashCounter {
            keys: vec![T::max_value(); capacity],
            counts: vec![0u16; capacity * nb_banks],
            nb_banks,
            mask: capacity - 1,
            occupied: 0,
            limit: capacity * HASH_LOAD_PERCENT / 100,
        })
    }

    fn hash(&self, kmer: T) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        kmer.hash(&mut hasher);
        hasher.finish()
    }

    /// False when the table got overfull, the caller falls back to the
    /// vector strategy.
    fn insert(&mut self, kmer: T, bank: usize) -> bool {
        let mut index = self.hash(kmer) as usize & self.mask;

        loop {
            if self.keys[index] == kmer {
                let slot = index * self.nb_banks + bank;
                self.counts[slot] = self.counts[slot].saturating_add(1);
                return true;
            }
            if self.keys[index] == T::max_value() {
                if self.occupied >= self.limit {
                    return false;
                }
                self.keys[index] = kmer;
                self.occupied += 1;
                let slot = index * self.nb_banks + bank;
                self.counts[slot] = 1;
                return true;
            }
            index = (index + 1) & self.mask;
        }
    }

    /// Emit every (kmer, counts) in ascending kmer order.
    fn drain_sorted<F>(self, mut emit: F) -> Result<()>
    where
        F: FnMut(T, &[u16], u32) -> Result<()>,
    {
        let mut filled: Vec<u32> = (0..self.keys.len() as u32)
            .filter(|&i| self.keys[i as usize] != T::max_value())
            .collect();
        filled.sort_unstable_by_key(|&i| self.keys[i as usize]);

        for index in filled {
            let index = index as usize;
            let counts = &self.counts[index * self.nb_banks..(index + 1) * self.nb_banks];
            let sum = counts.iter().map(|&c| c as u32).sum();
            emit(self.keys[index], counts, sum)?;
        }

        Ok(())
    }
}

fn for_each_kmer<T, F>(
    superkmers: &PartitionSet,
    part: usize,
    k: u8,
    mut f: F,
) -> Result<()>
where
    T: KmerSpace,
    F: FnMut(T, u8) -> Result<()>,
{
    let mut reader = SuperkmerReader::new(
        superkmers.reader(part)?,
        superkmers.partition_name(part),
    );
    while let Some((bank, seq)) = reader.next_record()? {
        for token in Tokenizer::<T>::new(&seq, k) {
            f(token.cannonical().0, bank)?;
        }
    }
    Ok(())
}

fn count_partition_hash<T: KmerSpace>(
    superkmers: &PartitionSet,
    part: usize,
    global_part: usize,
    k: u8,
    nb_banks: usize,
    memory_limit: usize,
    chain: &mut ProcessorChain<T>,
) -> Result<bool> {
    let expected = superkmers.nb_records(part) * KMERS_PER_SUPERKMER_HINT;
    let mut counter = match HashCounter::<T>::with_capacity(expected, nb_banks, memory_limit) {
        Some(counter) => counter,
        None => return Ok(false),
    };

    let mut overfull = false;
    for_each_kmer::<T, _>(superkmers, part, k, |kmer, bank| {
        if !overfull && !counter.insert(kmer, bank as usize) {
            overfull = true;
        }
        Ok(())
    })?;

    if overfull {
        return Ok(false);
    }

    counter.drain_sorted(|kmer, counts, sum| chain.process(global_part, kmer, counts, sum))?;
    Ok(true)
}

fn count_partition_vector<T: KmerSpace>(
    superkmers: &PartitionSet,
    part: usize,
    global_part: usize,
    k: u8,
    nb_banks: usize,
    chain: &mut ProcessorChain<T>,
) -> Result<()> {
    let mut entries: Vec<(T, u8)> = Vec::with_capacity(
        (superkmers.nb_records(part) * KMERS_PER_SUPERKMER_HINT) as usize,
    );
    for_each_kmer::<T, _>(superkmers, part, k, |kmer, bank| {
        entries.push((kmer, bank));
        Ok(())
    })?;

    entries.par_sort_unstable();

    let mut counts = vec![0u16; nb_banks];
    for (kmer, run) in &entries.iter().group_by(|(kmer, _)| *kmer) {
        counts.iter_mut().for_each(|c| *c = 0);
        for (_, bank) in run {
            counts[*bank as usize] = counts[*bank as usize].saturating_add(1);
        }
        let sum = counts.iter().map(|&c| c as u32).sum();
        chain.process(global_part, kmer, &counts, sum)?;
    }

    Ok(())
}

/// Count every partition of one pass, partitions run in parallel, each one
/// feeds its own processor chain in ascending cannonical kmer order.
pub fn count_pass<'a, T, F>(
    config: &Configuration,
    k: u8,
    nb_banks: usize,
    pass: usize,
    superkmers: &PartitionSet,
    factory: &F,
    pool: &rayon::ThreadPool,
    cancel: &CancelToken,
    progress: &dyn Progress,
) -> Result<()>
where
    T: KmerSpace,
    F: Fn(usize) -> Result<ProcessorChain<'a, T>> + Sync,
{
    progress.start("count", config.nb_partitions as u64);
    pool.install(|| {
        (0..config.nb_partitions)
            .into_par_iter()
            .try_for_each(|part| -> Result<()> {
                cancel.check()?;

                let global_part = pass * config.nb_partitions + part;
                let mut chain = factory(global_part)?;
                chain.begin_part(pass, part)?;

                let mut done = false;
                if config.partition_type == PartitionType::Hash {
                    done = count_partition_hash(
                        superkmers,
                        part,
                        global_part,
                        k,
                        nb_banks,
                        config.memory_per_partition_bytes(),
                        &mut chain,
                    )?;
                    if !done {
                        debug!("partition {} overfull, vector fallback", global_part);
                    }
                }
                if !done {
                    count_partition_vector(
                        superkmers,
                        part,
                        global_part,
                        k,
                        nb_banks,
                        &mut chain,
                    )?;
                }

                chain.end_part(pass, part)?;
                progress.step(1);
                Ok(())
            })
    })?;
    progress.stop();

    Ok(())
}

pub struct CountReport {
    pub nb_distinct: u64,
    pub nb_solid: u64,
    pub cutoff: u16,
    pub total_kmers: u64,
}

fn scratch_dir(options: &Options) -> Result<tempfile::TempDir> {
    let base = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| options.output.clone());

    Ok(tempfile::Builder::new()
        .prefix("comptoir")
        .tempdir_in(base)?)
}

fn solidity_as_str(kind: SolidityKind) -> &'static str {
    match kind {
        SolidityKind::Sum => "sum",
        SolidityKind::All => "all",
        SolidityKind::One => "one",
    }
}

fn solidity_from_str(value: &str, path: &str) -> Result<SolidityKind> {
    match value {
        "sum" => Ok(SolidityKind::Sum),
        "all" => Ok(SolidityKind::All),
        "one" => Ok(SolidityKind::One),
        other => Err(Error::SchemaMismatch {
            path: path.to_string(),
            message: format!("unknown solidity kind {}", other),
        }
        .into()),
    }
}

/// The whole sorting count: spill superkmers pass by pass, count each
/// partition, gate and dump solid records, publish the histogram and the
/// abundance cutoff.
pub fn count_all<T: KmerSpace>(
    options: &Options,
    config: &Configuration,
    order: &MinimizerOrder,
    repart: &Repartition,
    storage: &Storage,
    pool: &rayon::ThreadPool,
    cancel: &CancelToken,
    progress: &dyn Progress,
) -> Result<CountReport> {
    let dsk = storage.group("dsk")?;

    let result = count_all_inner::<T>(
        options, config, order, repart, storage, pool, cancel, progress, &dsk,
    );
    if result.is_err() {
        /* flag partial output, reopening it will fail */
        let _ = dsk.set_status(false);
    }
    result
}

fn count_all_inner<T: KmerSpace>(
    options: &Options,
    config: &Configuration,
    order: &MinimizerOrder,
    repart: &Repartition,
    storage: &Storage,
    pool: &rayon::ThreadPool,
    cancel: &CancelToken,
    progress: &dyn Progress,
    dsk: &crate::storage::Group,
) -> Result<CountReport> {
    let solid = dsk.partition("solid", config.nb_total_partitions())?;

    let shared_histogram = Arc::new(Mutex::new(Histogram::default()));
    let total_kmers = Arc::new(AtomicU64::new(0));
    let nb_written = Arc::new(AtomicU64::new(0));

    let gate_min = match options.abundance_min {
        AbundanceMin::Fixed(v) => v,
        AbundanceMin::Auto => 1,
    };

    let scratch = scratch_dir(options)?;
    let scratch_storage = Storage::create(scratch.path())?;
    let scratch_group = scratch_storage.group("superkmer")?;

    for pass in 0..config.nb_passes {
        cancel.check()?;

        let spill = scratch_group.partition(&format!("pass{}", pass), config.nb_partitions)?;
        partitioner::run_pass(
            options, config, order, repart, pass, &spill, pool, cancel, progress,
        )?;

        info!("count pass {}/{}", pass + 1, config.nb_passes);
        let factory = |global_part: usize| -> Result<ProcessorChain<T>> {
            Ok(ProcessorChain::new(vec![
                Box::new(HistogramProcessor::new(
                    shared_histogram.clone(),
                    total_kmers.clone(),
                )),
                Box::new(SolidityGate::new(
                    options.solidity,
                    gate_min,
                    options.abundance_max,
                )),
                Box::new(DumpProcessor::new(
                    solid.cache(global_part),
                    options.k,
                    nb_written.clone(),
                )),
            ]))
        };

        count_pass(
            config,
            options.k,
            config.nb_banks,
            pass,
            &spill,
            &factory,
            pool,
            cancel,
            progress,
        )?;

        spill.remove()?;
    }

    solid.seal()?;

    let histogram = shared_histogram
        .lock()
        .map_err(|_| Error::ConcurrentStateViolation)?
        .clone();

    let cutoff = match options.abundance_min {
        AbundanceMin::Fixed(v) => v,
        AbundanceMin::Auto => {
            let cutoff = histogram.first_local_minimum();
            info!("auto abundance threshold set to {}", cutoff);
            cutoff
        }
    };

    {
        use std::io::Write;

        let mut writer = dsk.collection("histogram").create(8)?;
        histogram.save(&mut writer)?;
        writer.flush()?;
    }

    let mut meta = dsk.metadata()?;
    meta.set_u64("kmer_size", options.k as u64);
    meta.set_u64("minimizer_size", options.m as u64);
    meta.set(
        "minimizer_type",
        match options.minimizer_type {
            crate::minimizer::MinimizerType::Lexicographic => "lex",
            crate::minimizer::MinimizerType::Frequency => "freq",
        },
    );
    meta.set(
        "abundance_min_user",
        &match options.abundance_min {
            AbundanceMin::Auto => "auto".to_string(),
            AbundanceMin::Fixed(v) => v.to_string(),
        },
    );
    meta.set_u64("abundance_min", cutoff as u64);
    meta.set_u64("abundance_max", options.abundance_max as u64);
    meta.set("solidity", solidity_as_str(options.solidity));
    meta.set_u64("nb_banks", config.nb_banks as u64);
    meta.set_u64(
        "partition_type",
        match config.partition_type {
            PartitionType::Hash => 0,
            PartitionType::Vector => 1,
        },
    );
    meta.set_u64("nb_passes", config.nb_passes as u64);
    meta.set_u64("nb_partitions", config.nb_partitions as u64);
    meta.set_u64("total_kmers", total_kmers.load(Ordering::Relaxed));
    meta.set_u64("nb_distinct", histogram.nb_distinct());
    meta.set(
        "properties",
        &crate::storage::properties_xml(
            "config",
            &[
                ("kmer_size", options.k.to_string()),
                ("mini_size", options.m.to_string()),
                ("abundance_min", cutoff.to_string()),
                ("abundance_max", options.abundance_max.to_string()),
                ("nb_passes", config.nb_passes.to_string()),
                ("nb_partitions", config.nb_partitions.to_string()),
                ("nb_cores", config.nb_cores.to_string()),
                ("max_memory", config.max_memory_mb.to_string()),
            ],
        ),
    );
    meta.save()?;
    dsk.set_status(true)?;

    let nb_solid = match options.abundance_min {
        AbundanceMin::Fixed(_) => nb_written.load(Ordering::Relaxed),
        AbundanceMin::Auto => SolidStream::<T>::open(storage)?.count()?,
    };

    let mut meta = dsk.metadata()?;
    meta.set_u64("nb_solid", nb_solid);
    meta.save()?;

    info!(
        "{} distinct kmers, {} solid with threshold {}",
        histogram.nb_distinct(),
        nb_solid,
        cutoff
    );

    Ok(CountReport {
        nb_distinct: histogram.nb_distinct(),
        nb_solid,
        cutoff,
        total_kmers: total_kmers.load(Ordering::Relaxed),
    })
}

/// Read back the solid kmer enumeration, applying the published solidity
/// predicate. Sorted within each partition, every kmer appears in exactly
/// one partition.
pub struct SolidStream<T> {
    set: PartitionSet,
    k: u8,
    nb_banks: usize,
    kind: SolidityKind,
    min: u16,
    max: u16,
    nb_solid: u64,
    phantom: std::marker::PhantomData<T>,
}

impl<T: KmerSpace> SolidStream<T> {
    pub fn open(storage: &Storage) -> Result<Self> {
        let dsk = storage.group("dsk")?;
        dsk.ensure_valid()?;

        let meta = dsk.metadata()?;
        let k = meta.require_u64("kmer_size")? as u8;
        let nb_banks = meta.require_u64("nb_banks")? as usize;
        let min = meta.require_u64("abundance_min")? as u16;
        let max = meta.require_u64("abundance_max")? as u16;
        let kind = solidity_from_str(
            meta.get("solidity").unwrap_or("sum"),
            &storage.root().display().to_string(),
        )?;
        let nb_solid = meta.get_u64("nb_solid").unwrap_or(0);

        if k > T::MAX_K {
            return Err(Error::SchemaMismatch {
                path: storage.root().display().to_string(),
                message: format!("kmer size {} doesn't fit the requested width", k),
            }
            .into());
        }

        Ok(SolidStream {
            set: dsk.open_partition("solid")?,
            k,
            nb_banks,
            kind,
            min,
            max,
            nb_solid,
            phantom: std::marker::PhantomData,
        })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn nb_banks(&self) -> usize {
        self.nb_banks
    }

    pub fn abundance_min(&self) -> u16 {
        self.min
    }

    /// Solid kmer count as published by the count stage.
    pub fn nb_solid(&self) -> u64 {
        self.nb_solid
    }

    pub fn nb_partition(&self) -> usize {
        self.set.nb_partition()
    }

    pub fn for_each_in_partition<F>(&self, part: usize, mut f: F) -> Result<()>
    where
        F: FnMut(T, u32) -> Result<()>,
    {
        let kmer_bytes = kmer::bytes_per_kmer(self.k);
        let record_size = count_record_size(self.k, self.nb_banks);
        let mut reader = self.set.reader(part)?;
        let path = self.set.partition_name(part);

        let mut buf = vec![0u8; record_size];
        let mut counts = vec![0u16; self.nb_banks];
        while crate::storage::read_exact_record(&mut reader, &mut buf, &path)? {
            for (bank, count) in counts.iter_mut().enumerate() {
                *count = u16::from_le_bytes([
                    buf[kmer_bytes + 2 * bank],
                    buf[kmer_bytes + 2 * bank + 1],
                ]);
            }
            let sum: u32 = counts.iter().map(|&c| c as u32).sum();
            if is_solid(self.kind, self.min, self.max, &counts, sum) {
                f(T::read_le(&buf[..kmer_bytes]), sum)?;
            }
        }

        Ok(())
    }

    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(T, u32) -> Result<()>,
    {
        for part in 0..self.set.nb_partition() {
            self.for_each_in_partition(part, &mut f)?;
        }
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let mut count = 0u64;
        self.for_each(|_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }
}
