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
use anyhow::Result;
use log::{debug, info};
use rayon::prelude::*;

/* local use */
use crate::bloom::{Bloom, BloomVariant, DEFAULT_FP};
use crate::config::{BloomKind, DebloomKind, Options};
use crate::count::SolidStream;
use crate::error::Error;
use crate::kmer::{self, KmerSpace};
use crate::storage::Storage;

pub const BLOOM_SEED: u32 = 101010;

/// Constant time, bounded memory membership over the solid kmer set.
///
/// The main Bloom answers true for every solid kmer, the cascading critical
/// false positive sets remove the neighbour kmers it wrongly accepts. The
/// alternation ends on an exact sorted set, whose side makes every solid
/// kmer answer true again.
#[derive(Debug)]
pub struct Membership<T> {
    kind: DebloomKind,
    bloom: Option<Bloom>,
    cascade: Vec<Bloom>,
    exact: Vec<T>,
}

impl<T: KmerSpace> Membership<T> {
    /// `kmer` must be cannonical.
    pub fn contains(&self, kmer: T) -> bool {
        match self.kind {
            DebloomKind::None => self.exact.binary_search(&kmer).is_ok(),
            DebloomKind::Original => match &self.bloom {
                Some(bloom) => {
                    bloom.contains(&kmer) && self.exact.binary_search(&kmer).is_err()
                }
                None => false,
            },
            DebloomKind::Cascading => {
                let bloom = match &self.bloom {
                    Some(bloom) => bloom,
                    None => return false,
                };
                if !bloom.contains(&kmer) {
                    return false;
                }
                if !self.cascade[0].contains(&kmer) {
                    return true;
                }
                if !self.cascade[1].contains(&kmer) {
                    return false;
                }
                if !self.cascade[2].contains(&kmer) {
                    return true;
                }
                self.exact.binary_search(&kmer).is_ok()
            }
        }
    }

    pub fn kind(&self) -> DebloomKind {
        self.kind
    }

    pub fn nb_exact(&self) -> usize {
        self.exact.len()
    }
}

/// The eight cannonical neighbours of a cannonical kmer.
fn neighbours<T: KmerSpace>(kmer: T, k: u8, out: &mut Vec<T>) {
    out.clear();
    for bit in 0..4u8 {
        out.push(kmer::cannonical(kmer::succ(kmer, k, bit), k).0);
        out.push(kmer::cannonical(kmer::pred(kmer, k, bit), k).0);
    }
}

fn collect_solid_sorted<T: KmerSpace>(stream: &SolidStream<T>) -> Result<Vec<T>> {
    let mut solid = Vec::with_capacity(stream.nb_solid() as usize);
    stream.for_each(|kmer, _| {
        solid.push(kmer);
        Ok(())
    })?;
    solid.sort_unstable();
    Ok(solid)
}

/// Build the membership structure from the solid enumeration.
pub fn build<T: KmerSpace>(
    options: &Options,
    storage: &Storage,
    pool: &rayon::ThreadPool,
) -> Result<Membership<T>> {
    let stream = SolidStream::<T>::open(storage)?;
    let k = stream.k();

    if options.bloom == BloomKind::None || options.debloom == DebloomKind::None {
        info!("exact membership, no bloom");
        return Ok(Membership {
            kind: DebloomKind::None,
            bloom: None,
            cascade: Vec::new(),
            exact: collect_solid_sorted(&stream)?,
        });
    }

    let variant = match options.bloom {
        BloomKind::Cache => BloomVariant::Cache,
        _ => BloomVariant::Basic,
    };

    info!("build bloom over {} solid kmers", stream.nb_solid());
    let bloom = Bloom::with_dimensions(variant, stream.nb_solid(), DEFAULT_FP, BLOOM_SEED);
    pool.install(|| {
        (0..stream.nb_partition())
            .into_par_iter()
            .try_for_each(|part| {
                stream.for_each_in_partition(part, |kmer, _| {
                    bloom.insert(&kmer);
                    Ok(())
                })
            })
    })?;

    /* neighbours of solid passing the bloom, solid excluded, are the
    critical false positives */
    info!("enumerate critical false positive candidates");
    let mut candidates: Vec<T> = pool.install(|| {
        (0..stream.nb_partition())
            .into_par_iter()
            .map(|part| -> Result<Vec<T>> {
                let mut local = Vec::new();
                let mut around = Vec::with_capacity(8);
                stream.for_each_in_partition(part, |kmer, _| {
                    neighbours(kmer, k, &mut around);
                    for &neighbour in around.iter() {
                        if bloom.contains(&neighbour) {
                            local.push(neighbour);
                        }
                    }
                    Ok(())
                })?;
                Ok(local)
            })
            .try_reduce(Vec::new, |mut a, mut b| {
                a.append(&mut b);
                Ok(a)
            })
    })?;

    candidates.par_sort_unstable();
    candidates.dedup();

    /* subtract the solid set */
    let mut in_solid = bv::BitVec::<u64>::new_fill(false, candidates.len() as u64);
    stream.for_each(|kmer, _| {
        if let Ok(index) = candidates.binary_search(&kmer) {
            in_solid.set(index as u64, true);
        }
        Ok(())
    })?;
    let t1: Vec<T> = candidates
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !in_solid.get(*index as u64))
        .map(|(_, kmer)| kmer)
        .collect();
    debug!("{} critical false positives", t1.len());

    if options.debloom == DebloomKind::Original {
        return Ok(Membership {
            kind: DebloomKind::Original,
            bloom: Some(bloom),
            cascade: Vec::new(),
            exact: t1,
        });
    }

    /* cascade: bloom over cFP, solid caught by it, cFP caught again, then
    an exact set on the solid side */
    let b1 = Bloom::with_dimensions(BloomVariant::Basic, t1.len() as u64, DEFAULT_FP, BLOOM_SEED + 1);
    for kmer in t1.iter() {
        b1.insert(kmer);
    }

    let mut t2 = Vec::new();
    stream.for_each(|kmer, _| {
        if b1.contains(&kmer) {
            t2.push(kmer);
        }
        Ok(())
    })?;

    let b2 = Bloom::with_dimensions(BloomVariant::Basic, t2.len() as u64, DEFAULT_FP, BLOOM_SEED + 2);
    for kmer in t2.iter() {
        b2.insert(kmer);
    }

    let t3: Vec<T> = t1.into_iter().filter(|kmer| b2.contains(kmer)).collect();

    let b3 = Bloom::with_dimensions(BloomVariant::Basic, t3.len() as u64, DEFAULT_FP, BLOOM_SEED + 3);
    for kmer in t3.iter() {
        b3.insert(kmer);
    }

    let mut t4: Vec<T> = t2.into_iter().filter(|kmer| b3.contains(kmer)).collect();
    t4.sort_unstable();

    debug!(
        "cascade sizes: {} {} {}",
        b1.size_bits(),
        b2.size_bits(),
        b3.size_bits()
    );

    Ok(Membership {
        kind: DebloomKind::Cascading,
        bloom: Some(bloom),
        cascade: vec![b1, b2, b3],
        exact: t4,
    })
}

fn debloom_kind_str(kind: DebloomKind) -> &'static str {
    match kind {
        DebloomKind::None => "none",
        DebloomKind::Original => "original",
        DebloomKind::Cascading => "cascading",
    }
}

pub fn save<T: KmerSpace>(membership: &Membership<T>, storage: &Storage, k: u8) -> Result<()> {
    if let Some(bloom) = &membership.bloom {
        let group = storage.group("bloom")?;
        let mut writer = group.collection("bits").create(0)?;
        bloom.save(&mut writer)?;
        writer.flush()?;

        let mut meta = group.metadata()?;
        meta.set("kind", bloom.variant().as_str());
        meta.set_u64("size_bits", bloom.size_bits());
        meta.set_u64("nb_hash", bloom.nb_hash() as u64);
        meta.save()?;
        group.set_status(true)?;
    }

    let group = storage.group("debloom")?;
    for (level, bloom) in membership.cascade.iter().enumerate() {
        let mut writer = group.collection(&format!("cfp_{}", level)).create(0)?;
        bloom.save(&mut writer)?;
        writer.flush()?;
    }

    if membership.kind != DebloomKind::None {
        let kmer_bytes = kmer::bytes_per_kmer(k);
        let mut writer = group.collection("cfp_3").create(kmer_bytes)?;
        let mut buf = vec![0u8; kmer_bytes];
        for kmer in membership.exact.iter() {
            kmer.write_le(&mut buf);
            writer.write_all(&buf)?;
        }
        writer.flush()?;
    }

    let mut meta = group.metadata()?;
    meta.set("kind", debloom_kind_str(membership.kind));
    meta.set_u64("nb_exact", membership.exact.len() as u64);
    meta.save()?;
    group.set_status(true)?;

    Ok(())
}

pub fn load<T: KmerSpace>(storage: &Storage) -> Result<Membership<T>> {
    let group = storage.group("debloom")?;
    group.ensure_valid()?;

    let meta = group.metadata()?;
    let kind = match meta.get("kind") {
        Some("none") | None => DebloomKind::None,
        Some("original") => DebloomKind::Original,
        Some("cascading") => DebloomKind::Cascading,
        Some(other) => {
            return Err(Error::SchemaMismatch {
                path: storage.root().display().to_string(),
                message: format!("unknown debloom kind {}", other),
            }
            .into())
        }
    };

    if kind == DebloomKind::None {
        let stream = SolidStream::<T>::open(storage)?;
        return Ok(Membership {
            kind,
            bloom: None,
            cascade: Vec::new(),
            exact: collect_solid_sorted(&stream)?,
        });
    }

    let stream = SolidStream::<T>::open(storage)?;
    let k = stream.k();

    let bloom_group = storage.group("bloom")?;
    bloom_group.ensure_valid()?;
    let bloom_meta = bloom_group.metadata()?;
    let variant = BloomVariant::from_str(
        bloom_meta.get("kind").unwrap_or("cache"),
        &storage.root().display().to_string(),
    )?;
    let collection = bloom_group.collection("bits");
    let mut reader = collection.open(0)?;
    let bloom = Bloom::load(&mut reader, variant, &collection.path().display().to_string())?;

    let mut cascade = Vec::new();
    if kind == DebloomKind::Cascading {
        for level in 0..3 {
            let collection = group.collection(&format!("cfp_{}", level));
            let mut reader = collection.open(0)?;
            cascade.push(Bloom::load(
                &mut reader,
                BloomVariant::Basic,
                &collection.path().display().to_string(),
            )?);
        }
    }

    let kmer_bytes = kmer::bytes_per_kmer(k);
    let collection = group.collection("cfp_3");
    let mut reader = collection.open(kmer_bytes)?;
    let mut exact = Vec::with_capacity(meta.get_u64("nb_exact").unwrap_or(0) as usize);
    let mut buf = vec![0u8; kmer_bytes];
    let path = collection.path().display().to_string();
    while crate::storage::read_exact_record(&mut reader, &mut buf, &path)? {
        exact.push(T::read_le(&buf));
    }

    Ok(Membership {
        kind,
        bloom: Some(bloom),
        cascade,
        exact,
    })
}
