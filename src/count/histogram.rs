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

/* crate use */
use anyhow::Result;

pub const NB_BINS: usize = 256;

/// Bounded abundance histogram, the last bin aggregates everything above.
#[derive(Clone)]
pub struct Histogram {
    bins: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram {
            bins: vec![0; NB_BINS],
        }
    }
}

impl Histogram {
    pub fn inc(&mut self, abundance: u32) {
        let bin = (abundance as usize).min(NB_BINS - 1);
        self.bins[bin] += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (a, b) in self.bins.iter_mut().zip(other.bins.iter()) {
            *a += b;
        }
    }

    pub fn bin(&self, index: usize) -> u64 {
        self.bins[index]
    }

    pub fn nb_distinct(&self) -> u64 {
        self.bins.iter().sum()
    }

    pub fn nb_solid(&self, cutoff: u16) -> u64 {
        self.bins[(cutoff as usize).min(NB_BINS - 1)..].iter().sum()
    }

    /// Classical auto threshold: the valley between the sequencing error
    /// peak at abundance 1 and the coverage peak. First index, scanning from
    /// 2, strictly below its left neighbour and followed by an upturn.
    /// Falls back to 2 on a monotone histogram.
    pub fn first_local_minimum(&self) -> u16 {
        for i in 2..(NB_BINS - 1) {
            if self.bins[i] < self.bins[i - 1] && self.bins[i + 1] > self.bins[i] {
                return i as u16;
            }
        }
        2
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        for bin in self.bins.iter() {
            writer.write_all(&bin.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bins = vec![0u64; NB_BINS];
        let mut buf = [0u8; 8];
        for bin in bins.iter_mut() {
            reader.read_exact(&mut buf)?;
            *bin = u64::from_le_bytes(buf);
        }
        Ok(Histogram { bins })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_count() {
        let mut a = Histogram::default();
        a.inc(1);
        a.inc(1);
        a.inc(5);

        let mut b = Histogram::default();
        b.inc(5);
        b.inc(1000);

        a.merge(&b);
        assert_eq!(a.bin(1), 2);
        assert_eq!(a.bin(5), 2);
        assert_eq!(a.bin(NB_BINS - 1), 1);
        assert_eq!(a.nb_distinct(), 5);
        assert_eq!(a.nb_solid(5), 3);
    }

    #[test]
    fn local_minimum_in_a_valley() {
        let mut h = Histogram::default();
        /* error peak at 1, valley at 3, coverage peak at 8 */
        for (abundance, amount) in [(1, 100), (2, 40), (3, 5), (4, 8), (8, 60)].iter() {
            for _ in 0..*amount {
                h.inc(*abundance);
            }
        }

        assert_eq!(h.first_local_minimum(), 3);
    }

    #[test]
    fn monotone_histogram_falls_back() {
        let mut h = Histogram::default();
        for (abundance, amount) in [(1, 100), (2, 40), (3, 10), (4, 2)].iter() {
            for _ in 0..*amount {
                h.inc(*abundance);
            }
        }

        assert_eq!(h.first_local_minimum(), 2);
    }

    #[test]
    fn save_load_roundtrip() {
        let mut h = Histogram::default();
        h.inc(1);
        h.inc(7);
        h.inc(300);

        let mut buf = Vec::new();
        h.save(&mut buf).unwrap();
        assert_eq!(buf.len(), NB_BINS * 8);

        let back = Histogram::load(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(back.bin(1), 1);
        assert_eq!(back.bin(7), 1);
        assert_eq!(back.bin(NB_BINS - 1), 1);
    }
}
