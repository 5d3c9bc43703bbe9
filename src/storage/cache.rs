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

/* crate use */
use anyhow::Result;

/* local use */
use crate::storage::PartitionSet;

pub const CACHE_RECORDS: usize = 64 * 1024;
pub const CACHE_BYTES: usize = 1024 * 1024;

/// Thread local write buffer over one partition.
///
/// Appends are batched until either bound is hit, the flush then takes the
/// partition mutex. Flush is explicit and also runs on drop, a drop flush
/// failure is only logged so errors must be collected through `flush`.
pub struct CacheWriter<'a> {
    set: &'a PartitionSet,
    index: usize,
    buf: Vec<u8>,
    nb_record: u64,
}

impl<'a> CacheWriter<'a> {
    pub fn new(set: &'a PartitionSet, index: usize) -> Self {
        CacheWriter {
            set,
            index,
            buf: Vec::with_capacity(CACHE_BYTES),
            nb_record: 0,
        }
    }

    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(record);
        self.nb_record += 1;

        if self.nb_record as usize >= CACHE_RECORDS || self.buf.len() >= CACHE_BYTES {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        self.set
            .flush_buffer(self.index, &self.buf, self.nb_record)?;
        self.buf.clear();
        self.nb_record = 0;

        Ok(())
    }
}

impl<'a> Drop for CacheWriter<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("flush of a partition cache failed durring drop: {}", e);
        }
    }
}
