//! Sort-merge key/value collector.
//!
//! Entries are buffered in memory until the byte budget is exceeded, then the
//! buffer is sorted and spilled as a run into an anonymous temp file inside
//! the collector's directory. `load` merges all runs with a heap and hands the
//! entries to the caller in ascending key order. Duplicate keys are not merged;
//! they arrive adjacent to each other.

use crate::compress::{encode_varint, read_uvarint};
use crate::error::CompressionError;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default in-memory budget before a sorted run is written to disk.
pub const ETL_BUFFER_OPTIMAL_SIZE: usize = 256 * 1024 * 1024;

// Per-entry bookkeeping charged against the buffer budget.
const ENTRY_OVERHEAD: usize = 48;

pub struct Collector {
    log_prefix: String,
    tmp_dir: PathBuf,
    buffer_size: usize,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    entries_size: usize,
    runs: Vec<File>,
    collected: u64,
}

impl Collector {
    pub fn new(log_prefix: &str, tmp_dir: impl AsRef<Path>, buffer_size: usize) -> Self {
        Collector {
            log_prefix: log_prefix.to_string(),
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
            buffer_size: buffer_size.max(1),
            entries: Vec::new(),
            entries_size: 0,
            runs: Vec::new(),
            collected: 0,
        }
    }

    pub fn collect(&mut self, k: &[u8], v: &[u8]) -> Result<(), CompressionError> {
        self.entries_size += k.len() + v.len() + ENTRY_OVERHEAD;
        self.entries.push((k.to_vec(), v.to_vec()));
        self.collected += 1;
        if self.entries_size >= self.buffer_size {
            self.spill()?;
        }
        Ok(())
    }

    /// Number of entries collected so far, including spilled ones.
    pub fn len(&self) -> u64 {
        self.collected
    }

    pub fn is_empty(&self) -> bool {
        self.collected == 0
    }

    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    fn sort_buffer(&mut self) {
        // stable, so duplicates keep their collection order
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    fn spill(&mut self) -> Result<(), CompressionError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        self.sort_buffer();

        let file = tempfile::tempfile_in(&self.tmp_dir).map_err(|e| {
            CompressionError::FileCreate {
                path: self.tmp_dir.clone(),
                source: e,
            }
        })?;
        let mut w = BufWriter::new(file);
        let mut num_buf = [0u8; 10];
        for (k, v) in self.entries.drain(..) {
            let n = encode_varint(&mut num_buf, k.len() as u64);
            w.write_all(&num_buf[..n])?;
            w.write_all(&k)?;
            let n = encode_varint(&mut num_buf, v.len() as u64);
            w.write_all(&num_buf[..n])?;
            w.write_all(&v)?;
        }
        let mut file = w
            .into_inner()
            .map_err(|e| CompressionError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;

        log::trace!(
            "[{}] etl: spilled run {} ({} bytes buffered)",
            self.log_prefix,
            self.runs.len(),
            self.entries_size
        );
        self.runs.push(file);
        self.entries_size = 0;
        Ok(())
    }

    /// Feeds every collected entry to `load_func` in ascending key order.
    pub fn load<F>(mut self, mut load_func: F) -> Result<(), CompressionError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<(), CompressionError>,
    {
        if self.runs.is_empty() {
            self.sort_buffer();
            for (k, v) in &self.entries {
                load_func(k, v)?;
            }
            return Ok(());
        }

        self.spill()?;
        log::debug!(
            "[{}] etl: merging {} runs, {} entries",
            self.log_prefix,
            self.runs.len(),
            self.collected
        );

        let mut readers: Vec<RunReader> = self
            .runs
            .drain(..)
            .map(|f| RunReader {
                r: BufReader::with_capacity(256 * 1024, f),
            })
            .collect();

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some((key, value)) = reader.next_entry()? {
                heap.push(HeapEntry { key, value, run });
            }
        }

        while let Some(top) = heap.pop() {
            load_func(&top.key, &top.value)?;
            if let Some((key, value)) = readers[top.run].next_entry()? {
                heap.push(HeapEntry {
                    key,
                    value,
                    run: top.run,
                });
            }
        }
        Ok(())
    }
}

struct RunReader {
    r: BufReader<File>,
}

impl RunReader {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, CompressionError> {
        let kl = match read_uvarint(&mut self.r) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = self.read_bytes(kl)?;
        let vl = read_uvarint(&mut self.r)
            .map_err(|e| CompressionError::Collector(format!("truncated run: {}", e)))?;
        let value = self.read_bytes(vl)?;
        Ok(Some((key, value)))
    }

    fn read_bytes(&mut self, l: u64) -> Result<Vec<u8>, CompressionError> {
        let mut buf = vec![0u8; l as usize];
        self.r
            .read_exact(&mut buf)
            .map_err(|e| CompressionError::Collector(format!("truncated run: {}", e)))?;
        Ok(buf)
    }
}

// Min-heap order: smallest key first, earlier run first among equal keys.
struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    run: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.run.cmp(&self.run))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}
