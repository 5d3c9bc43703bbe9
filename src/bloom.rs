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
use std::hash::Hash;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/* crate use */
use ahash::RandomState;
use anyhow::{Context, Result};

/* local use */
use crate::error::Error;

/// Default false positive probability, 2^-4.
pub const DEFAULT_FP: f64 = 0.0625;

/* one cache line */
const BLOCK_BITS: u64 = 512;
const BLOCK_MASK: u64 = BLOCK_BITS - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomVariant {
    Basic,
    /// First probe picks a 64 byte block, the other probes stay inside it.
    Cache,
}

impl BloomVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            BloomVariant::Basic => "basic",
            BloomVariant::Cache => "cache",
        }
    }

    pub fn from_str(value: &str, path: &str) -> Result<Self> {
        match value {
            "basic" => Ok(BloomVariant::Basic),
            "cache" => Ok(BloomVariant::Cache),
            other => Err(Error::SchemaMismatch {
                path: path.to_string(),
                message: format!("unknown bloom kind {}", other),
            }
            .into()),
        }
    }
}

/// Optimal bit count and hash count for a target false positive rate.
pub fn dimensions(nb_items: u64, fp: f64) -> (u64, usize) {
    let n = nb_items.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;

    let bits = (-(n * fp.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
    let nb_hash = ((ln2 * bits as f64 / n).round() as usize).max(1).min(16);

    (bits, nb_hash)
}

/// Bloom filter over hashable values, insertion only uses word level atomic
/// or, so the build can share the filter between threads without a mutex.
#[derive(Debug)]
pub struct Bloom {
    variant: BloomVariant,
    size_bits: u64,
    nb_hash: usize,
    seed: u32,
    words: Vec<AtomicU64>,
    builders: (RandomState, RandomState),
}

impl Bloom {
    pub fn new(variant: BloomVariant, size_bits: u64, nb_hash: usize, seed: u32) -> Self {
        /* cache blocks must be whole */
        let size_bits = match variant {
            BloomVariant::Basic => size_bits.max(64),
            BloomVariant::Cache => {
                (size_bits.max(BLOCK_BITS) + BLOCK_BITS - 1) / BLOCK_BITS * BLOCK_BITS
            }
        };

        let words = (0..(size_bits + 63) / 64).map(|_| AtomicU64::new(0)).collect();

        Bloom {
            variant,
            size_bits,
            nb_hash,
            seed,
            words,
            builders: builders(seed),
        }
    }

    pub fn with_dimensions(variant: BloomVariant, nb_items: u64, fp: f64, seed: u32) -> Self {
        let (size_bits, nb_hash) = dimensions(nb_items, fp);
        Self::new(variant, size_bits, nb_hash, seed)
    }

    pub fn size_bits(&self) -> u64 {
        self.size_bits
    }

    pub fn nb_hash(&self) -> usize {
        self.nb_hash
    }

    pub fn variant(&self) -> BloomVariant {
        self.variant
    }

    fn hashes<T: Hash>(&self, x: &T) -> (u64, u64) {
        (self.builders.0.hash_one(x), self.builders.1.hash_one(x))
    }

    fn indices<T: Hash>(&self, x: &T, out: &mut Vec<u64>) {
        out.clear();
        let (h0, h1) = self.hashes(x);

        match self.variant {
            BloomVariant::Basic => {
                let step = (h1 % self.size_bits).max(1);
                let mut index = h0 % self.size_bits;
                for _ in 0..self.nb_hash {
                    out.push(index);
                    index = (index + step) % self.size_bits;
                }
            }
            BloomVariant::Cache => {
                let block = (h0 % (self.size_bits / BLOCK_BITS)) * BLOCK_BITS;
                let step = (h1 & BLOCK_MASK) | 1;
                let mut local = h0 & BLOCK_MASK;
                for _ in 0..self.nb_hash {
                    out.push(block | local);
                    local = (local + step) & BLOCK_MASK;
                }
            }
        }
    }

    pub fn insert<T: Hash>(&self, x: &T) {
        let mut indices = Vec::with_capacity(self.nb_hash);
        self.indices(x, &mut indices);
        for index in indices {
            self.words[(index / 64) as usize]
                .fetch_or(1u64 << (index % 64), Ordering::Relaxed);
        }
    }

    pub fn contains<T: Hash>(&self, x: &T) -> bool {
        let mut indices = Vec::with_capacity(self.nb_hash);
        self.indices(x, &mut indices);
        indices.into_iter().all(|index| {
            self.words[(index / 64) as usize].load(Ordering::Relaxed) & (1u64 << (index % 64))
                != 0
        })
    }

    /* wire format: size_bits, nb_hash, seed, bit array */

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.size_bits.to_le_bytes())?;
        writer.write_all(&(self.nb_hash as u32).to_le_bytes())?;
        writer.write_all(&self.seed.to_le_bytes())?;
        for word in self.words.iter() {
            writer.write_all(&word.load(Ordering::Relaxed).to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R, variant: BloomVariant, path: &str) -> Result<Self> {
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        reader.read_exact(&mut buf8).with_context(|| Error::CorruptPartition {
            path: path.to_string(),
        })?;
        let size_bits = u64::from_le_bytes(buf8);

        reader.read_exact(&mut buf4).with_context(|| Error::CorruptPartition {
            path: path.to_string(),
        })?;
        let nb_hash = u32::from_le_bytes(buf4) as usize;

        reader.read_exact(&mut buf4).with_context(|| Error::CorruptPartition {
            path: path.to_string(),
        })?;
        let seed = u32::from_le_bytes(buf4);

        let nb_words = (size_bits + 63) / 64;
        let mut words = Vec::with_capacity(nb_words as usize);
        for _ in 0..nb_words {
            reader.read_exact(&mut buf8).with_context(|| Error::CorruptPartition {
                path: path.to_string(),
            })?;
            words.push(AtomicU64::new(u64::from_le_bytes(buf8)));
        }

        Ok(Bloom {
            variant,
            size_bits,
            nb_hash,
            seed,
            words,
            builders: builders(seed),
        })
    }
}

fn builders(seed: u32) -> (RandomState, RandomState) {
    let seed = seed as u64;
    (
        RandomState::with_seeds(seed, seed + 1, seed + 2, seed + 3),
        RandomState::with_seeds(seed + 4, seed + 5, seed + 6, seed + 7),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negative() {
        for variant in [BloomVariant::Basic, BloomVariant::Cache].iter() {
            let bloom = Bloom::with_dimensions(*variant, 1000, DEFAULT_FP, 42);
            for x in 0u64..1000 {
                bloom.insert(&x);
            }
            for x in 0u64..1000 {
                assert!(bloom.contains(&x));
            }
        }
    }

    #[test]
    fn few_false_positive() {
        let bloom = Bloom::with_dimensions(BloomVariant::Cache, 10_000, DEFAULT_FP, 42);
        for x in 0u64..10_000 {
            bloom.insert(&x);
        }

        let fp = (10_000u64..110_000).filter(|x| bloom.contains(x)).count();
        /* 2^-4 expected, cache locality degrades it a little */
        assert!(fp < 20_000, "false positive rate too high: {}", fp);
    }

    #[test]
    fn cache_probes_share_a_block() {
        let bloom = Bloom::new(BloomVariant::Cache, 1 << 20, 4, 42);

        let mut indices = Vec::new();
        for x in 0u64..100 {
            bloom.indices(&x, &mut indices);
            let block = indices[0] / BLOCK_BITS;
            for &index in indices.iter() {
                assert_eq!(index / BLOCK_BITS, block);
            }
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let bloom = Bloom::with_dimensions(BloomVariant::Basic, 1000, DEFAULT_FP, 7);
        for x in 0u64..1000 {
            bloom.insert(&x);
        }

        let mut buf = Vec::new();
        bloom.save(&mut buf).unwrap();

        let back = Bloom::load(&mut std::io::Cursor::new(buf), BloomVariant::Basic, "x").unwrap();
        assert_eq!(back.size_bits(), bloom.size_bits());
        assert_eq!(back.nb_hash(), bloom.nb_hash());
        for x in 0u64..1000 {
            assert!(back.contains(&x));
        }
    }

    #[test]
    fn dimensions_default_fp() {
        let (bits, nb_hash) = dimensions(1_000_000, DEFAULT_FP);
        /* about 5.77 bits and 4 hashes per item at p = 2^-4 */
        assert!(bits > 5_000_000 && bits < 6_500_000);
        assert_eq!(nb_hash, 4);
    }
}
