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
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};

/* crate use */
use ahash::RandomState;
use anyhow::{Context, Result};
use rustc_hash::FxHashMap;

/* local use */
use crate::count::SolidStream;
use crate::error::Error;
use crate::kmer::{self, KmerSpace};
use crate::storage::Storage;

const GAMMA: u64 = 2;
const MAX_LEVELS: usize = 16;
const LEVEL_SEED: u32 = 48611;

#[derive(Debug)]
struct Level {
    size: u64,
    seed: u32,
    words: Vec<u64>,
    /* cumulative set bits before each word, offset by the previous levels */
    ranks: Vec<u64>,
}

impl Level {
    fn position<T: std::hash::Hash>(&self, key: &T) -> u64 {
        let seed = self.seed as u64;
        let builder = RandomState::with_seeds(seed, seed + 1, seed + 2, seed + 3);
        builder.hash_one(key) % self.size
    }

    fn bit(&self, position: u64) -> bool {
        self.words[(position / 64) as usize] & (1u64 << (position % 64)) != 0
    }

    fn rank(&self, position: u64) -> u64 {
        let word = (position / 64) as usize;
        let below = self.words[word] & ((1u64 << (position % 64)) - 1);
        self.ranks[word] + below.count_ones() as u64
    }
}

/// Minimal perfect hash over the solid kmer set, bbhash construction: per
/// level, keys alone on their position get its bit, colliding keys retry on
/// the next level, stragglers land in an exact map.
#[derive(Debug)]
pub struct Mphf<T> {
    levels: Vec<Level>,
    fallback: FxHashMap<T, u64>,
    nb_keys: u64,
}

impl<T: KmerSpace> Mphf<T> {
    pub fn build(keys: Vec<T>) -> Self {
        let nb_keys = keys.len() as u64;
        let mut levels = Vec::new();
        let mut remaining = keys;
        let mut offset = 0u64;

        for depth in 0..MAX_LEVELS {
            if remaining.is_empty() {
                break;
            }

            let size = (GAMMA * remaining.len() as u64).max(64) / 64 * 64;
            let seed = LEVEL_SEED + depth as u32;
            let nb_words = (size / 64) as usize;

            let mut level = Level {
                size,
                seed,
                words: vec![0u64; nb_words],
                ranks: vec![0u64; nb_words],
            };

            let mut collided = vec![0u64; nb_words];
            for key in remaining.iter() {
                let position = level.position(key);
                let word = (position / 64) as usize;
                let bit = 1u64 << (position % 64);
                if level.words[word] & bit != 0 {
                    collided[word] |= bit;
                } else {
                    level.words[word] |= bit;
                }
            }
            /* keep only positions hit exactly once */
            for (word, collision) in level.words.iter_mut().zip(collided.iter()) {
                *word &= !collision;
            }

            let mut next = Vec::new();
            for key in remaining {
                let position = level.position(&key);
                if !level.bit(position) {
                    next.push(key);
                }
            }

            let mut rank = offset;
            for (index, word) in level.words.iter().enumerate() {
                level.ranks[index] = rank;
                rank += word.count_ones() as u64;
            }
            offset = rank;

            levels.push(level);
            remaining = next;
        }

        let fallback = remaining
            .into_iter()
            .enumerate()
            .map(|(index, key)| (key, offset + index as u64))
            .collect();

        Mphf {
            levels,
            fallback,
            nb_keys,
        }
    }

    pub fn nb_keys(&self) -> u64 {
        self.nb_keys
    }

    /// Dense index of a solid kmer. No membership guarantee: for a kmer
    /// outside the build set the result is arbitrary, callers check
    /// membership first.
    pub fn index(&self, key: &T) -> u64 {
        for level in self.levels.iter() {
            let position = level.position(key);
            if level.bit(position) {
                return level.rank(position);
            }
        }
        self.fallback.get(key).copied().unwrap_or(0)
    }

    pub fn save<W: Write>(&self, writer: &mut W, kmer_bytes: usize) -> Result<()> {
        writer.write_all(&self.nb_keys.to_le_bytes())?;
        writer.write_all(&(self.levels.len() as u32).to_le_bytes())?;
        for level in self.levels.iter() {
            writer.write_all(&level.size.to_le_bytes())?;
            writer.write_all(&level.seed.to_le_bytes())?;
            for word in level.words.iter() {
                writer.write_all(&word.to_le_bytes())?;
            }
        }

        writer.write_all(&(self.fallback.len() as u64).to_le_bytes())?;
        let mut pairs: Vec<(&T, &u64)> = self.fallback.iter().collect();
        pairs.sort_by_key(|(key, _)| **key);
        let mut buf = vec![0u8; kmer_bytes];
        for (key, index) in pairs {
            key.write_le(&mut buf);
            writer.write_all(&buf)?;
            writer.write_all(&index.to_le_bytes())?;
        }

        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R, kmer_bytes: usize, path: &str) -> Result<Self> {
        let corrupt = || Error::CorruptPartition {
            path: path.to_string(),
        };

        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        reader.read_exact(&mut buf8).with_context(corrupt)?;
        let nb_keys = u64::from_le_bytes(buf8);

        reader.read_exact(&mut buf4).with_context(corrupt)?;
        let nb_levels = u32::from_le_bytes(buf4) as usize;

        let mut levels = Vec::with_capacity(nb_levels);
        let mut offset = 0u64;
        for _ in 0..nb_levels {
            reader.read_exact(&mut buf8).with_context(corrupt)?;
            let size = u64::from_le_bytes(buf8);
            reader.read_exact(&mut buf4).with_context(corrupt)?;
            let seed = u32::from_le_bytes(buf4);

            let nb_words = (size / 64) as usize;
            let mut words = Vec::with_capacity(nb_words);
            for _ in 0..nb_words {
                reader.read_exact(&mut buf8).with_context(corrupt)?;
                words.push(u64::from_le_bytes(buf8));
            }

            let mut ranks = vec![0u64; nb_words];
            for (index, word) in words.iter().enumerate() {
                ranks[index] = offset;
                offset += word.count_ones() as u64;
            }

            levels.push(Level {
                size,
                seed,
                words,
                ranks,
            });
        }

        reader.read_exact(&mut buf8).with_context(corrupt)?;
        let nb_fallback = u64::from_le_bytes(buf8);
        let mut fallback = FxHashMap::default();
        let mut key_buf = vec![0u8; kmer_bytes];
        for _ in 0..nb_fallback {
            reader.read_exact(&mut key_buf).with_context(corrupt)?;
            reader.read_exact(&mut buf8).with_context(corrupt)?;
            fallback.insert(T::read_le(&key_buf), u64::from_le_bytes(buf8));
        }

        Ok(Mphf {
            levels,
            fallback,
            nb_keys,
        })
    }
}

/// The perfect hash plus its parallel annotation arrays: saturated 8 bit
/// abundance, written once, and a deletion bitmap updated with byte wide
/// compare and swap.
#[derive(Debug)]
pub struct KmerIndex<T> {
    mphf: Mphf<T>,
    abundance: Vec<u8>,
    deleted: Vec<AtomicU8>,
}

impl<T: KmerSpace> KmerIndex<T> {
    /// Stream the solid enumeration and build everything.
    pub fn build(storage: &Storage) -> Result<Self> {
        let stream = SolidStream::<T>::open(storage)?;

        let mut keys = Vec::with_capacity(stream.nb_solid() as usize);
        let mut sums = Vec::with_capacity(stream.nb_solid() as usize);
        stream.for_each(|kmer, sum| {
            keys.push(kmer);
            sums.push(sum.min(255) as u8);
            Ok(())
        })?;

        let mphf = Mphf::build(keys.clone());

        let mut abundance = vec![0u8; keys.len()];
        for (key, sum) in keys.iter().zip(sums.iter()) {
            abundance[mphf.index(key) as usize] = *sum;
        }

        let deleted = (0..(keys.len() + 7) / 8).map(|_| AtomicU8::new(0)).collect();

        Ok(KmerIndex {
            mphf,
            abundance,
            deleted,
        })
    }

    pub fn nb_keys(&self) -> u64 {
        self.mphf.nb_keys()
    }

    pub fn index(&self, kmer: &T) -> u64 {
        self.mphf.index(kmer)
    }

    pub fn abundance_at(&self, index: u64) -> u8 {
        self.abundance[index as usize]
    }

    pub fn abundance(&self, kmer: &T) -> u8 {
        self.abundance_at(self.index(kmer))
    }

    pub fn is_deleted_at(&self, index: u64) -> bool {
        let byte = self.deleted[(index / 8) as usize].load(Ordering::Relaxed);
        byte & (1u8 << (index % 8)) != 0
    }

    pub fn is_deleted(&self, kmer: &T) -> bool {
        self.is_deleted_at(self.index(kmer))
    }

    fn set_deleted_at(&self, index: u64, value: bool) {
        let slot = &self.deleted[(index / 8) as usize];
        let bit = 1u8 << (index % 8);
        let mut old = slot.load(Ordering::Relaxed);
        loop {
            let new = if value { old | bit } else { old & !bit };
            match slot.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    pub fn delete(&self, kmer: &T) {
        self.set_deleted_at(self.index(kmer), true);
    }

    pub fn undelete(&self, kmer: &T) {
        self.set_deleted_at(self.index(kmer), false);
    }

    pub fn save(&self, storage: &Storage, k: u8) -> Result<()> {
        let group = storage.group("mphf")?;

        let mut writer = group.collection("mphf").create(0)?;
        self.mphf.save(&mut writer, kmer::bytes_per_kmer(k))?;
        writer.flush()?;

        let mut writer = group.collection("abundance").create(1)?;
        writer.write_all(&self.abundance)?;
        writer.flush()?;

        let mut writer = group.collection("deleted").create(1)?;
        for byte in self.deleted.iter() {
            writer.write_all(&[byte.load(Ordering::Relaxed)])?;
        }
        writer.flush()?;

        let mut meta = group.metadata()?;
        meta.set_u64("nb_keys", self.mphf.nb_keys());
        meta.save()?;
        group.set_status(true)?;

        Ok(())
    }

    pub fn load(storage: &Storage, k: u8) -> Result<Self> {
        let group = storage.group("mphf")?;
        group.ensure_valid()?;

        let collection = group.collection("mphf");
        let mut reader = collection.open(0)?;
        let mphf = Mphf::load(
            &mut reader,
            kmer::bytes_per_kmer(k),
            &collection.path().display().to_string(),
        )?;

        let mut abundance = Vec::new();
        group
            .collection("abundance")
            .open(1)?
            .read_to_end(&mut abundance)?;

        let mut deleted_bytes = Vec::new();
        group
            .collection("deleted")
            .open(1)?
            .read_to_end(&mut deleted_bytes)?;
        let deleted = deleted_bytes.into_iter().map(AtomicU8::new).collect();

        Ok(KmerIndex {
            mphf,
            abundance,
            deleted,
        })
    }
}
