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
pub mod cache;

/* std use */
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/* crate use */
use anyhow::{Context, Result};

/* local use */
use crate::error::Error;

/// File-tree container: one directory per group, one file per collection or
/// partition, metadata in sibling `.meta` files. Readers only ever see sealed
/// content, writers are append-only.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref()).with_context(|| Error::CantWriteFile {
            filename: root.as_ref().display().to_string(),
        })?;

        Ok(Storage {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        if !root.as_ref().is_dir() {
            return Err(Error::CantReadFile {
                filename: root.as_ref().display().to_string(),
            }
            .into());
        }

        Ok(Storage {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group(&self, name: &str) -> Result<Group> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).with_context(|| Error::CantWriteFile {
            filename: dir.display().to_string(),
        })?;

        Ok(Group {
            dir,
            name: name.to_string(),
        })
    }
}

pub struct Group {
    dir: PathBuf,
    name: String,
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> Result<Metadata> {
        Metadata::load(self.dir.join(".meta"))
    }

    /// Terminal error path: partial output is flagged so a later open fails.
    pub fn set_status(&self, valid: bool) -> Result<()> {
        let mut meta = self.metadata()?;
        meta.set("status", if valid { "valid" } else { "invalid" });
        meta.save()
    }

    pub fn ensure_valid(&self) -> Result<()> {
        let meta = self.metadata()?;
        if meta.get("status") == Some("invalid") {
            return Err(Error::SchemaMismatch {
                path: self.dir.display().to_string(),
                message: "group is flagged invalid, a previous build failed".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            path: self.dir.join(name),
            meta_path: self.dir.join(format!("{}.meta", name)),
        }
    }

    pub fn partition(&self, name: &str, nb_partition: usize) -> Result<PartitionSet> {
        PartitionSet::create(&self.dir, name, nb_partition)
    }

    pub fn open_partition(&self, name: &str) -> Result<PartitionSet> {
        PartitionSet::open(&self.dir, name)
    }
}

/// String keyed metadata attached to a group or a collection.
pub struct Metadata {
    path: PathBuf,
    map: BTreeMap<String, String>,
}

impl Metadata {
    pub fn load(path: PathBuf) -> Result<Self> {
        let mut map = BTreeMap::new();

        if path.is_file() {
            let content =
                std::fs::read_to_string(&path).with_context(|| Error::CantReadFile {
                    filename: path.display().to_string(),
                })?;
            for line in content.lines() {
                if let Some(tab) = line.find('\t') {
                    map.insert(
                        line[..tab].to_string(),
                        line[tab + 1..].replace("\\n", "\n"),
                    );
                }
            }
        }

        Ok(Metadata { path, map })
    }

    pub fn save(&self) -> Result<()> {
        let mut out = String::new();
        for (key, value) in self.map.iter() {
            out.push_str(key);
            out.push('\t');
            out.push_str(&value.replace('\n', "\\n"));
            out.push('\n');
        }

        std::fs::write(&self.path, out).with_context(|| Error::CantWriteFile {
            filename: self.path.display().to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set(key, &value.to_string());
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get_u64(key).ok_or_else(|| {
            Error::SchemaMismatch {
                path: self.path.display().to_string(),
                message: format!("missing metadata key {}", key),
            }
            .into()
        })
    }
}

/// Build parameters are also kept as one xml blob, mirroring what the
/// original tools write in their container.
pub fn properties_xml(name: &str, pairs: &[(&str, String)]) -> String {
    let mut out = format!("<{}>", name);
    for (key, value) in pairs {
        out.push_str(&format!("<{}>{}</{}>", key, value, key));
    }
    out.push_str(&format!("</{}>", name));
    out
}

/// Single stream of records.
pub struct Collection {
    path: PathBuf,
    meta_path: PathBuf,
}

impl Collection {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Result<Metadata> {
        Metadata::load(self.meta_path.clone())
    }

    /// Create or truncate, declaring the record size (0 for variable length
    /// records).
    pub fn create(&self, record_size: usize) -> Result<std::io::BufWriter<std::fs::File>> {
        let mut meta = self.metadata()?;
        meta.set_u64("record_size", record_size as u64);
        meta.set_u64("timestamp", unix_time());
        meta.save()?;

        let file = std::fs::File::create(&self.path).with_context(|| Error::CantWriteFile {
            filename: self.path.display().to_string(),
        })?;

        Ok(std::io::BufWriter::new(file))
    }

    /// Open for sequential scan, checking the declared record size.
    pub fn open(&self, record_size: usize) -> Result<std::io::BufReader<std::fs::File>> {
        let meta = self.metadata()?;
        let declared = meta.require_u64("record_size")? as usize;
        if declared != record_size {
            return Err(Error::SchemaMismatch {
                path: self.path.display().to_string(),
                message: format!(
                    "record size is {} but {} was expected",
                    declared, record_size
                ),
            }
            .into());
        }

        let file = std::fs::File::open(&self.path).with_context(|| Error::CantReadFile {
            filename: self.path.display().to_string(),
        })?;

        Ok(std::io::BufReader::new(file))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn len_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Typed parallel streams numbered 0..nb_partition.
///
/// One producer appends through a thread local cache, flushes serialise on
/// the partition mutex. Once sealed the set is read only.
pub struct PartitionSet {
    dir: PathBuf,
    name: String,
    files: Vec<Mutex<std::fs::File>>,
    records: Vec<AtomicU64>,
}

impl PartitionSet {
    fn partition_path(dir: &Path, name: &str, index: usize) -> PathBuf {
        dir.join(format!("{}.{}", name, index))
    }

    fn create(dir: &Path, name: &str, nb_partition: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(nb_partition);
        let mut records = Vec::with_capacity(nb_partition);
        for index in 0..nb_partition {
            let path = Self::partition_path(dir, name, index);
            let file = std::fs::File::create(&path).with_context(|| Error::CantWriteFile {
                filename: path.display().to_string(),
            })?;
            files.push(Mutex::new(file));
            records.push(AtomicU64::new(0));
        }

        let mut meta = Metadata::load(dir.join(format!("{}.meta", name)))?;
        meta.set_u64("nb_partition", nb_partition as u64);
        meta.set_u64("timestamp", unix_time());
        meta.save()?;

        Ok(PartitionSet {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            files,
            records,
        })
    }

    fn open(dir: &Path, name: &str) -> Result<Self> {
        let meta = Metadata::load(dir.join(format!("{}.meta", name)))?;
        let nb_partition = meta.require_u64("nb_partition")? as usize;

        let mut records = Vec::with_capacity(nb_partition);
        for index in 0..nb_partition {
            records.push(AtomicU64::new(
                meta.get_u64(&format!("records.{}", index)).unwrap_or(0),
            ));
        }

        Ok(PartitionSet {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            files: Vec::new(),
            records,
        })
    }

    pub fn nb_partition(&self) -> usize {
        self.records.len()
    }

    pub fn nb_records(&self, index: usize) -> u64 {
        self.records[index].load(Ordering::Relaxed)
    }

    pub fn cache(&self, index: usize) -> cache::CacheWriter {
        cache::CacheWriter::new(self, index)
    }

    pub(crate) fn flush_buffer(&self, index: usize, buf: &[u8], nb_record: u64) -> Result<()> {
        let path = Self::partition_path(&self.dir, &self.name, index);
        let mut file = self
            .files[index]
            .lock()
            .map_err(|_| Error::ConcurrentStateViolation)?;
        file.write_all(buf)
            .map_err(|e| crate::error::from_io(&e, &path.display().to_string()))?;
        self.records[index].fetch_add(nb_record, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and persist the record counts, writers are done after this.
    pub fn seal(&self) -> Result<()> {
        for file in self.files.iter() {
            let mut file = file.lock().map_err(|_| Error::ConcurrentStateViolation)?;
            file.flush().map_err(|e| {
                crate::error::from_io(&e, &self.dir.join(&self.name).display().to_string())
            })?;
        }

        let mut meta = Metadata::load(self.dir.join(format!("{}.meta", self.name)))?;
        for (index, count) in self.records.iter().enumerate() {
            meta.set_u64(
                &format!("records.{}", index),
                count.load(Ordering::Relaxed),
            );
        }
        meta.save()
    }

    pub fn reader(&self, index: usize) -> Result<std::io::BufReader<std::fs::File>> {
        let path = Self::partition_path(&self.dir, &self.name, index);
        let file = std::fs::File::open(&path).with_context(|| Error::CantReadFile {
            filename: path.display().to_string(),
        })?;
        Ok(std::io::BufReader::new(file))
    }

    pub fn partition_name(&self, index: usize) -> String {
        format!("{}.{}", self.name, index)
    }

    pub fn remove(&self) -> Result<()> {
        for index in 0..self.nb_partition() {
            let path = Self::partition_path(&self.dir, &self.name, index);
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }
        let meta = self.dir.join(format!("{}.meta", self.name));
        if meta.is_file() {
            std::fs::remove_file(meta)?;
        }
        Ok(())
    }
}

/// Read one fixed size record, `Ok(false)` on a clean end of stream,
/// CorruptPartition on a truncated one.
pub fn read_exact_record<R: Read>(reader: &mut R, buf: &mut [u8], path: &str) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .with_context(|| Error::ReadingError {
                filename: path.to_string(),
            })?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::CorruptPartition {
                path: path.to_string(),
            }
            .into());
        }
        filled += n;
    }
    Ok(true)
}

pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
