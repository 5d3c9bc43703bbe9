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
use std::io::Read;
use std::path::Path;

/* crate use */
use anyhow::{Context, Result};
use log::{debug, info};
use rayon::prelude::*;

/* local use */
use crate::config::{BankEstimate, Configuration, Options};
use crate::error::Error;
use crate::kmer;
use crate::minimizer::{MinimizerOrder, MinimizerRing, MinimizerType, Repartition};
use crate::progress::{CancelToken, Progress};
use crate::storage::cache::CacheWriter;
use crate::storage::PartitionSet;

const SAMPLE_SEQUENCES: usize = 10_000;
const BATCH_SEQUENCES: usize = 4096;
const COMPRESSED_VOLUME_FACTOR: u64 = 3;

pub fn open_bank(path: &Path) -> Result<bio::io::fasta::Records<Box<dyn Read>>> {
    let (reader, _compression) = niffler::get_reader(Box::new(std::io::BufReader::new(
        std::fs::File::open(path).with_context(|| Error::CantReadFile {
            filename: path.display().to_string(),
        })?,
    )))?;

    Ok(bio::io::fasta::Reader::new(reader).records())
}

fn is_compressed(path: &Path) -> Result<bool> {
    let (_, compression) = niffler::get_reader(Box::new(std::io::BufReader::new(
        std::fs::File::open(path).with_context(|| Error::CantReadFile {
            filename: path.display().to_string(),
        })?,
    )))?;

    Ok(compression != niffler::compression::Format::No)
}

/// Sample the head of every bank to guess sequence count and kmer volume.
pub fn estimate(options: &Options) -> Result<BankEstimate> {
    let mut nb_sequence = 0u64;
    let mut nb_kmer = 0u64;

    for path in options.inputs.iter() {
        let mut sampled_seq = 0u64;
        let mut sampled_bases = 0u64;
        let mut sampled_bytes = 0u64;

        for record in open_bank(path)?.take(SAMPLE_SEQUENCES) {
            let record = record.with_context(|| Error::ReadingError {
                filename: path.display().to_string(),
            })?;
            sampled_seq += 1;
            sampled_bases += record.seq().len() as u64;
            sampled_bytes += record.seq().len() as u64 + record.id().len() as u64 + 2;
        }

        if sampled_seq == 0 {
            continue;
        }

        let mut file_bytes = std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or(sampled_bytes);
        if is_compressed(path)? {
            file_bytes *= COMPRESSED_VOLUME_FACTOR;
        }

        let bank_seq = (file_bytes / (sampled_bytes / sampled_seq).max(1)).max(sampled_seq);
        let mean_len = sampled_bases / sampled_seq;

        nb_sequence += bank_seq;
        if mean_len >= options.k as u64 {
            nb_kmer += bank_seq * (mean_len - options.k as u64 + 1);
        }
    }

    debug!(
        "bank estimation: {} sequences, {} kmers",
        nb_sequence, nb_kmer
    );

    Ok(BankEstimate {
        nb_sequence,
        nb_kmer,
    })
}

/// Sampled cannonical m-mer frequencies, input of the frequency order.
pub fn sample_minimizer_freqs(options: &Options) -> Result<Vec<u32>> {
    let mut freqs = vec![0u32; 1 << (2 * options.m)];
    let m = options.m;

    for path in options.inputs.iter() {
        for record in open_bank(path)?.take(SAMPLE_SEQUENCES) {
            let record = record.with_context(|| Error::ReadingError {
                filename: path.display().to_string(),
            })?;
            for token in kmer::Tokenizer::<u64>::new(record.seq(), m) {
                let (mmer, _) = token.cannonical();
                freqs[mmer as usize] = freqs[mmer as usize].saturating_add(1);
            }
        }
    }

    Ok(freqs)
}

/// Build the order then the repartition table, once, before pass 0.
pub fn build_repartition(
    options: &Options,
    config: &Configuration,
) -> Result<(MinimizerOrder, Repartition)> {
    match options.minimizer_type {
        MinimizerType::Lexicographic => {
            let order = MinimizerOrder::lexicographic(options.m);
            let repart =
                Repartition::lexicographic(&order, config.nb_passes, config.nb_partitions);
            Ok((order, repart))
        }
        MinimizerType::Frequency => {
            info!("sample minimizer frequency");
            let freqs = sample_minimizer_freqs(options)?;
            let order = MinimizerOrder::frequency(options.m, &freqs);
            let repart = Repartition::frequency(&freqs, config.nb_passes, config.nb_partitions);
            Ok((order, repart))
        }
    }
}

/* superkmer wire format: bank, nt length, 2 bits packed bases */

pub fn encode_superkmer(bank: u8, seq: &[u8], buf: &mut Vec<u8>) {
    buf.clear();
    buf.push(bank);
    buf.extend_from_slice(&(seq.len() as u16).to_le_bytes());

    let mut byte = 0u8;
    for (i, nuc) in seq.iter().enumerate() {
        byte |= kmer::nuc2bit(*nuc) << (6 - 2 * (i % 4));
        if i % 4 == 3 {
            buf.push(byte);
            byte = 0;
        }
    }
    if seq.len() % 4 != 0 {
        buf.push(byte);
    }
}

/// Sequential scan over one superkmer partition.
pub struct SuperkmerReader<R> {
    reader: R,
    path: String,
}

impl<R: Read> SuperkmerReader<R> {
    pub fn new(reader: R, path: String) -> Self {
        SuperkmerReader { reader, path }
    }

    /// Next record as (bank, ascii sequence), None on a clean end.
    pub fn next_record(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let mut head = [0u8; 3];
        if !crate::storage::read_exact_record(&mut self.reader, &mut head, &self.path)? {
            return Ok(None);
        }

        let bank = head[0];
        let len = u16::from_le_bytes([head[1], head[2]]) as usize;
        let mut packed = vec![0u8; (len + 3) / 4];
        let ok = crate::storage::read_exact_record(&mut self.reader, &mut packed, &self.path)?;
        if !ok && len != 0 {
            return Err(Error::CorruptPartition {
                path: self.path.clone(),
            }
            .into());
        }

        let mut seq = Vec::with_capacity(len);
        for i in 0..len {
            let bit = (packed[i / 4] >> (6 - 2 * (i % 4))) & 0b11;
            seq.push(kmer::bit2nuc(bit));
        }

        Ok(Some((bank, seq)))
    }
}

struct SuperkmerSplitter<'a> {
    k: u8,
    pass: usize,
    order: &'a MinimizerOrder,
    repart: &'a Repartition,
    partitions: &'a PartitionSet,
    ring: MinimizerRing,
    caches: Vec<Option<CacheWriter<'a>>>,
    scratch: Vec<u8>,
}

impl<'a> SuperkmerSplitter<'a> {
    fn new(
        k: u8,
        m: u8,
        pass: usize,
        order: &'a MinimizerOrder,
        repart: &'a Repartition,
        partitions: &'a PartitionSet,
    ) -> Self {
        SuperkmerSplitter {
            k,
            pass,
            order,
            repart,
            partitions,
            ring: MinimizerRing::new((k - m + 1) as usize),
            caches: (0..repart.nb_partition()).map(|_| None).collect(),
            scratch: Vec::new(),
        }
    }

    fn emit(&mut self, bank: u8, seq: &[u8], minimizer: u64) -> Result<()> {
        if self.repart.pass_of(minimizer) != self.pass {
            return Ok(());
        }

        let partition = self.repart.partition_of(minimizer);
        if self.caches[partition].is_none() {
            self.caches[partition] = Some(self.partitions.cache(partition));
        }

        /* the record length field is 16 bits, overlong runs are cut with a
        k-1 overlap so no kmer is lost */
        let max_len = u16::max_value() as usize;
        let mut start = 0;
        loop {
            let end = (start + max_len).min(seq.len());
            encode_superkmer(bank, &seq[start..end], &mut self.scratch);
            match self.caches[partition].as_mut() {
                Some(cache) => cache.write_record(&self.scratch)?,
                None => return Err(Error::ConcurrentStateViolation.into()),
            }

            if end == seq.len() {
                return Ok(());
            }
            start = end - (self.k as usize - 1);
        }
    }

    /// Cut one read into maximal runs of kmers sharing their minimizer.
    fn split(&mut self, bank: u8, seq: &[u8]) -> Result<()> {
        let k = self.k as usize;
        let m = self.order.m();
        let m_mask = kmer::mask::<u64>(m);

        let mut mmer_forward = 0u64;
        let mut mmer_reverse = 0u64;
        let mut filled = 0usize;
        let mut run_start = 0usize;
        let mut superkmer_start = 0usize;
        let mut current_min: Option<u64> = None;
        self.ring.clear();

        for (i, nuc) in seq.iter().enumerate() {
            if !kmer::valid_nuc(*nuc) {
                if let Some(minimizer) = current_min.take() {
                    self.emit(bank, &seq[superkmer_start..i], minimizer)?;
                }
                filled = 0;
                run_start = i + 1;
                self.ring.clear();
                continue;
            }

            let bit = kmer::nuc2bit(*nuc);
            mmer_forward = ((mmer_forward << 2) | bit as u64) & m_mask;
            mmer_reverse = (mmer_reverse >> 2) | (((bit ^ 0b10) as u64) << (2 * (m - 1) as usize));
            filled += 1;

            if filled >= m as usize {
                let mmer = mmer_forward.min(mmer_reverse);
                self.ring.insert(self.order.rank(mmer), mmer, i);
            }

            if i + 1 - run_start >= k {
                let minimizer = self.ring.min().ok_or(Error::ConcurrentStateViolation)?;
                match current_min {
                    None => {
                        current_min = Some(minimizer);
                        superkmer_start = i + 1 - k;
                    }
                    Some(previous) if previous == minimizer => {}
                    Some(previous) => {
                        self.emit(bank, &seq[superkmer_start..i], previous)?;
                        current_min = Some(minimizer);
                        superkmer_start = i + 1 - k;
                    }
                }
            }
        }

        if let Some(minimizer) = current_min.take() {
            self.emit(bank, &seq[superkmer_start..], minimizer)?;
        }

        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        for cache in self.caches.iter_mut().flatten() {
            cache.flush()?;
        }
        Ok(())
    }
}

/// One partitioning pass: split every read of every bank into superkmers and
/// spill them into the pass partitions.
pub fn run_pass(
    options: &Options,
    config: &Configuration,
    order: &MinimizerOrder,
    repart: &Repartition,
    pass: usize,
    partitions: &PartitionSet,
    pool: &rayon::ThreadPool,
    cancel: &CancelToken,
    progress: &dyn Progress,
) -> Result<()> {
    info!(
        "partitioning pass {}/{} over {} banks",
        pass + 1,
        config.nb_passes,
        options.inputs.len()
    );
    progress.start("partition", 0);

    for (bank, path) in options.inputs.iter().enumerate() {
        let mut records = open_bank(path)?;

        loop {
            cancel.check()?;

            let mut batch: Vec<Vec<u8>> = Vec::with_capacity(BATCH_SEQUENCES);
            for record in records.by_ref().take(BATCH_SEQUENCES) {
                let record = record.with_context(|| Error::ReadingError {
                    filename: path.display().to_string(),
                })?;
                batch.push(record.seq().to_vec());
            }
            if batch.is_empty() {
                break;
            }
            progress.step(batch.len() as u64);

            let chunk_size = (batch.len() / config.nb_cores).max(1);
            pool.install(|| {
                batch
                    .par_chunks(chunk_size)
                    .try_for_each(|chunk| -> Result<()> {
                        let mut splitter = SuperkmerSplitter::new(
                            options.k,
                            options.m,
                            pass,
                            order,
                            repart,
                            partitions,
                        );
                        for seq in chunk {
                            splitter.split(bank as u8, seq)?;
                        }
                        splitter.finish()
                    })
            })?;
        }
    }

    partitions.seal()?;
    progress.stop();
    debug!("pass {} sealed", pass);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn write_fasta(dir: &Path, name: &str, seqs: &[&str]) -> std::path::PathBuf {
        use std::io::Write;

        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for (i, seq) in seqs.iter().enumerate() {
            writeln!(file, ">{}\n{}", i, seq).unwrap();
        }
        path
    }

    #[test]
    fn superkmer_roundtrip() {
        let mut buf = Vec::new();
        encode_superkmer(1, b"AATGCTTGCA", &mut buf);

        let mut reader = SuperkmerReader::new(std::io::Cursor::new(buf), "test".to_string());
        let (bank, seq) = reader.next_record().unwrap().unwrap();
        assert_eq!(bank, 1);
        assert_eq!(seq, b"AATGCTTGCA".to_vec());
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn estimate_counts_kmers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fasta(dir.path(), "reads.fasta", &["AATGCAATGC", "TTTTTTTTTT"]);

        let mut options = Options::new(vec![path], dir.path().join("out"), 5);
        options.nb_cores = 1;
        let estimate = estimate(&options).unwrap();

        assert!(estimate.nb_sequence >= 2);
        assert!(estimate.nb_kmer >= 12);
    }

    #[test]
    fn every_kmer_lands_in_exactly_one_partition() {
        let dir = tempfile::tempdir().unwrap();
        let seq = "AGGCGCTAGGGTAGAGGATGATGAAGGCGCAT";
        let path = write_fasta(dir.path(), "reads.fasta", &[seq]);

        let mut options = Options::new(vec![path], dir.path().join("out"), 11);
        options.m = 5;
        options.nb_cores = 1;

        let estimate = estimate(&options).unwrap();
        let config = crate::config::configure(&options, &estimate).unwrap();
        let (order, repart) = build_repartition(&options, &config).unwrap();

        let storage = Storage::create(dir.path().join("out")).unwrap();
        let group = storage.group("tmp").unwrap();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let cancel = CancelToken::new();

        let mut seen = Vec::new();
        for pass in 0..config.nb_passes {
            let partitions = group
                .partition(&format!("pass{}", pass), config.nb_partitions)
                .unwrap();
            run_pass(
                &options,
                &config,
                &order,
                &repart,
                pass,
                &partitions,
                &pool,
                &cancel,
                &crate::progress::NoProgress,
            )
            .unwrap();

            for index in 0..partitions.nb_partition() {
                let mut reader = SuperkmerReader::new(
                    partitions.reader(index).unwrap(),
                    partitions.partition_name(index),
                );
                while let Some((_, superkmer)) = reader.next_record().unwrap() {
                    assert!(superkmer.len() >= 11);
                    for token in kmer::Tokenizer::<u64>::new(&superkmer, 11) {
                        seen.push(token.cannonical().0);
                    }
                }
            }
        }

        /* the multiset of kmers over all partitions is the read's multiset */
        let mut expect: Vec<u64> = kmer::Tokenizer::<u64>::new(seq.as_bytes(), 11)
            .map(|t| t.cannonical().0)
            .collect();
        expect.sort_unstable();
        seen.sort_unstable();
        assert_eq!(seen, expect);
    }
}
