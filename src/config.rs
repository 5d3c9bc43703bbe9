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
use std::path::PathBuf;

/* local use */
use crate::error::Error;
use crate::kmer;
use crate::minimizer::{MinimizerType, MAX_MINIMIZER_SIZE};
use crate::storage::cache::CACHE_BYTES;

const MAX_PASSES: usize = 64;
const MAX_PARTITIONS: usize = 4096;
const MIN_PARTITIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbundanceMin {
    Auto,
    Fixed(u16),
}

/// How the per bank abundance vector decides solidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolidityKind {
    /// Threshold applies to the sum over banks.
    Sum,
    /// Every bank must satisfy the threshold.
    All,
    /// At least one bank must satisfy the threshold.
    One,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomKind {
    None,
    Basic,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebloomKind {
    None,
    Original,
    Cascading,
}

/// User facing build parameters, the CLI maps one to one on this.
#[derive(Debug, Clone)]
pub struct Options {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub k: u8,
    pub m: u8,
    pub minimizer_type: MinimizerType,
    pub abundance_min: AbundanceMin,
    pub abundance_max: u16,
    pub solidity: SolidityKind,
    pub max_memory_mb: usize,
    pub max_disk_mb: usize,
    pub nb_cores: usize,
    pub bloom: BloomKind,
    pub debloom: DebloomKind,
}

impl Options {
    pub fn new(inputs: Vec<PathBuf>, output: PathBuf, k: u8) -> Self {
        Options {
            inputs,
            output,
            k,
            m: 8,
            minimizer_type: MinimizerType::Lexicographic,
            abundance_min: AbundanceMin::Fixed(2),
            abundance_max: u16::max_value(),
            solidity: SolidityKind::Sum,
            max_memory_mb: 2000,
            max_disk_mb: 0,
            nb_cores: 0,
            bloom: BloomKind::Cache,
            debloom: DebloomKind::Cascading,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        kmer::Width::for_k(self.k)?;

        if self.m >= self.k {
            return Err(Error::InvalidInput {
                message: format!(
                    "minimizer size {} must be smaller than kmer size {}",
                    self.m, self.k
                ),
            });
        }
        if self.m < 1 || self.m > MAX_MINIMIZER_SIZE {
            return Err(Error::InvalidInput {
                message: format!(
                    "minimizer size {} isn't in the supported range 1..={}",
                    self.m, MAX_MINIMIZER_SIZE
                ),
            });
        }
        if self.inputs.is_empty() {
            return Err(Error::InvalidInput {
                message: "at least one input bank is required".to_string(),
            });
        }
        if self.max_memory_mb == 0 {
            return Err(Error::InvalidInput {
                message: "max memory can't be zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Sampled shape of the input banks, used to size passes and partitions
/// before any real work.
#[derive(Debug, Clone, Copy, Default)]
pub struct BankEstimate {
    pub nb_sequence: u64,
    pub nb_kmer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Hash,
    Vector,
}

/// Resolved run shape: everything downstream reads its budget from here.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub nb_banks: usize,
    pub nb_passes: usize,
    /// Partitions per pass.
    pub nb_partitions: usize,
    pub partition_type: PartitionType,
    pub nb_cores: usize,
    pub nb_partitions_in_parallel: usize,
    pub nb_cores_per_partition: usize,
    pub max_memory_mb: usize,
    pub volume_mb: u64,
    pub kmers_estimate: u64,
}

impl Configuration {
    pub fn nb_total_partitions(&self) -> usize {
        self.nb_passes * self.nb_partitions
    }

    pub fn memory_per_partition_bytes(&self) -> usize {
        self.max_memory_mb * 1_000_000 / self.nb_partitions_in_parallel
    }
}

/// Choose passes and partitions so every partition fits the per worker
/// memory budget and a pass fits the disk budget. Fails with ResourceLimit
/// when no valid shape exists, before anything is written.
pub fn configure(options: &Options, estimate: &BankEstimate) -> Result<Configuration, Error> {
    options.validate()?;

    let nb_cores = if options.nb_cores == 0 {
        std::thread::available_parallelism().map_or(1, |x| x.get())
    } else {
        options.nb_cores
    };

    let kmer_bytes = kmer::bytes_per_kmer(options.k) as u64;
    let volume_mb = (estimate.nb_kmer * kmer_bytes / 1_000_000).max(1);

    let mut nb_passes = if options.max_disk_mb == 0 {
        1
    } else {
        ((volume_mb + options.max_disk_mb as u64 - 1) / options.max_disk_mb as u64) as usize
    };
    if nb_passes > MAX_PASSES {
        return Err(Error::ResourceLimit {
            message: format!(
                "input needs {} MB of scratch disk per pass but only {} MB are allowed",
                volume_mb / MAX_PASSES as u64,
                options.max_disk_mb
            ),
        });
    }
    nb_passes = nb_passes.max(1);

    let memory_bytes = options.max_memory_mb as u64 * 1_000_000;

    let mut nb_partitions;
    loop {
        let volume_per_pass = volume_mb / nb_passes as u64;
        let nb_partitions_in_parallel = nb_cores;
        let memory_per_partition = memory_bytes / nb_partitions_in_parallel as u64;

        /* sort workspace is roughly twice the partition payload */
        let wanted = (volume_per_pass * 1_000_000 * 2 + memory_per_partition - 1)
            / memory_per_partition;
        nb_partitions = (wanted as usize).max(MIN_PARTITIONS).max(nb_cores);

        if nb_partitions > MAX_PARTITIONS {
            if nb_passes < MAX_PASSES {
                nb_passes += 1;
                continue;
            }
            return Err(Error::ResourceLimit {
                message: format!(
                    "no pass/partition split fits {} MB of kmers in {} MB of memory",
                    volume_mb, options.max_memory_mb
                ),
            });
        }

        /* writer caches must fit the budget too, multi pass shrinks them */
        let cache_cost = (nb_cores * nb_partitions * CACHE_BYTES) as u64;
        if cache_cost > memory_bytes && nb_passes < MAX_PASSES {
            nb_passes += 1;
            continue;
        }

        break;
    }

    let volume_per_partition =
        volume_mb * 1_000_000 / (nb_passes as u64 * nb_partitions as u64);
    let memory_per_partition = memory_bytes / nb_cores as u64;
    let partition_type = if volume_per_partition * 3 <= memory_per_partition {
        PartitionType::Hash
    } else {
        PartitionType::Vector
    };

    let nb_partitions_in_parallel = nb_cores.min(nb_partitions);
    let nb_cores_per_partition = (nb_cores / nb_partitions_in_parallel).max(1);

    Ok(Configuration {
        nb_banks: options.inputs.len(),
        nb_passes,
        nb_partitions,
        partition_type,
        nb_cores,
        nb_partitions_in_parallel,
        nb_cores_per_partition,
        max_memory_mb: options.max_memory_mb,
        volume_mb,
        kmers_estimate: estimate.nb_kmer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Options {
        Options::new(
            vec![PathBuf::from("reads.fasta")],
            PathBuf::from("out"),
            21,
        )
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        let mut o = options();
        o.k = 64;
        assert!(o.validate().is_err());

        let mut o = options();
        o.m = 21;
        assert!(o.validate().is_err());

        let mut o = options();
        o.inputs.clear();
        assert!(o.validate().is_err());
    }

    #[test]
    fn small_input_single_pass() {
        let mut o = options();
        o.nb_cores = 4;
        let estimate = BankEstimate {
            nb_sequence: 1000,
            nb_kmer: 100_000,
        };

        let config = configure(&o, &estimate).unwrap();
        assert_eq!(config.nb_passes, 1);
        assert!(config.nb_partitions >= MIN_PARTITIONS);
        assert_eq!(config.nb_banks, 1);
    }

    #[test]
    fn disk_budget_forces_passes() {
        let mut o = options();
        o.nb_cores = 4;
        o.max_disk_mb = 1000;
        let estimate = BankEstimate {
            nb_sequence: 1 << 30,
            nb_kmer: 10_000_000_000,
        };

        let config = configure(&o, &estimate).unwrap();
        assert!(config.nb_passes > 1);
    }

    #[test]
    fn impossible_budget_is_reported() {
        let mut o = options();
        o.nb_cores = 4;
        o.max_disk_mb = 1;
        let estimate = BankEstimate {
            nb_sequence: 1 << 40,
            nb_kmer: 1 << 50,
        };

        assert!(configure(&o, &estimate).is_err());
    }
}
