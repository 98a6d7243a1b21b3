//! Word compressor: collects words, mines a pattern dictionary from them and
//! writes the Huffman-coded segment file.

use crate::dictionary_builder::{dictionary_builder_from_collectors, persist_dictionary};
use crate::error::CompressionError;
use crate::etl::{Collector, ETL_BUFFER_OPTIMAL_SIZE};
use crate::parallel_compress::{reduce_dict, superstring_worker, ReduceParams};
use crate::superstring;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// Maximum size of one superstring handed to an analysis worker.
pub const SUPERSTRING_LIMIT: usize = 16 * 1024 * 1024;

/// Maximum number of patterns kept in the dictionary.
pub const MAX_DICT_PATTERNS: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Cfg {
    pub min_pattern_score: u64,

    // shortest and longest substring considered for the dictionary
    pub min_pattern_len: usize,
    pub max_pattern_len: usize,

    // candidates longer than this must have a power of two length
    pub long_pattern_pow2_len: usize,

    // bytes subtracted from the pattern length when scoring one occurrence
    pub pattern_score_overhead: usize,

    pub max_dict_patterns: usize,

    // only every sampling_factor-th superstring is analysed
    pub sampling_factor: u64,

    pub superstring_limit: usize,

    pub workers: usize,

    pub etl_buffer_size: usize,
}

impl Default for Cfg {
    fn default() -> Self {
        Cfg {
            min_pattern_score: 1024,
            min_pattern_len: 5,
            max_pattern_len: 128,
            long_pattern_pow2_len: 20,
            pattern_score_overhead: 0,
            max_dict_patterns: MAX_DICT_PATTERNS,
            sampling_factor: 4,
            superstring_limit: SUPERSTRING_LIMIT,
            workers: 1,
            etl_buffer_size: ETL_BUFFER_OPTIMAL_SIZE,
        }
    }
}

impl Cfg {
    pub fn validate(&self) -> Result<(), CompressionError> {
        let fail = |msg: &str| Err(CompressionError::InvalidConfig(msg.to_string()));
        if self.workers == 0 {
            return fail("workers must be at least 1");
        }
        if self.sampling_factor == 0 {
            return fail("sampling_factor must be at least 1");
        }
        if self.min_pattern_len == 0 {
            return fail("min_pattern_len must be at least 1");
        }
        if self.min_pattern_len > self.max_pattern_len {
            return fail("min_pattern_len exceeds max_pattern_len");
        }
        if self.superstring_limit < superstring::encoded_len(1) {
            return fail("superstring_limit cannot hold a single byte");
        }
        Ok(())
    }
}

pub type CompressionRatio = f64;

pub fn ratio_to_string(ratio: CompressionRatio) -> String {
    format!("{:.2}", ratio)
}

pub struct Compressor {
    cfg: Cfg,
    output_file: PathBuf,
    file_name: String,
    tmp_dir: PathBuf,
    log_prefix: String,
    lvl: log::Level,
    trace: bool,

    // words spooled to disk for the second pass
    uncompressed_file: Option<RawWordsFile>,
    tmp_out_file_path: PathBuf,

    // Each byte b of a word becomes 0x01 b, and 0x00 0x00 follows each word
    superstring: Vec<u8>,
    superstring_count: u64,
    superstring_len: usize,
    superstring_tx: Option<SyncSender<Vec<u8>>>,
    analysis_workers: Vec<JoinHandle<Result<Collector, CompressionError>>>,

    words_count: u64,
    raw_bytes: u64,
    ratio: CompressionRatio,
    no_fsync: bool,
    compressed: bool,
    cancel: Arc<AtomicBool>,
}

impl Compressor {
    pub fn new(
        cfg: Cfg,
        output_file: impl AsRef<Path>,
        tmp_dir: impl AsRef<Path>,
        log_prefix: &str,
        lvl: log::Level,
    ) -> Result<Self, CompressionError> {
        cfg.validate()?;
        let output_file = output_file.as_ref().to_path_buf();
        if output_file.as_os_str().is_empty() {
            return Err(CompressionError::InvalidConfig(
                "output file path is empty".to_string(),
            ));
        }
        let file_name = output_file
            .file_name()
            .ok_or_else(|| {
                CompressionError::InvalidConfig(format!(
                    "output path {} has no file name",
                    output_file.display()
                ))
            })?
            .to_string_lossy()
            .to_string();

        let tmp_dir = tmp_dir.as_ref().to_path_buf();
        fs::create_dir_all(&tmp_dir).map_err(|e| CompressionError::FileCreate {
            path: tmp_dir.clone(),
            source: e,
        })?;

        // the ".tmp" file is renamed over the output once everything succeeded
        let mut tmp_out = output_file.clone().into_os_string();
        tmp_out.push(".tmp");
        let tmp_out_file_path = PathBuf::from(tmp_out);

        let uncompressed_file = RawWordsFile::new(tmp_dir.join(&file_name).with_extension("idt"))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = sync_channel::<Vec<u8>>(cfg.workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let mut analysis_workers = Vec::with_capacity(cfg.workers);
        for i in 0..cfg.workers {
            let rx = Arc::clone(&rx);
            let cfg = cfg.clone();
            let tmp_dir = tmp_dir.clone();
            let log_prefix = log_prefix.to_string();
            let cancel = Arc::clone(&cancel);
            let handle = std::thread::Builder::new()
                .name(format!("superstring-{}", i))
                .spawn(move || superstring_worker(&rx, &cfg, &tmp_dir, &log_prefix, &cancel))?;
            analysis_workers.push(handle);
        }

        Ok(Compressor {
            trace: lvl == log::Level::Trace,
            cfg,
            output_file,
            file_name,
            tmp_dir,
            log_prefix: log_prefix.to_string(),
            lvl,
            uncompressed_file: Some(uncompressed_file),
            tmp_out_file_path,
            superstring: Vec::with_capacity(1024 * 1024),
            superstring_count: 0,
            superstring_len: 0,
            superstring_tx: Some(tx),
            analysis_workers,
            words_count: 0,
            raw_bytes: 0,
            ratio: 0.0,
            no_fsync: false,
            compressed: false,
            cancel,
        })
    }

    /// Number of words added so far.
    pub fn count(&self) -> u64 {
        self.words_count
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Shared flag; setting it makes every worker and `compress` stop with
    /// `CompressionError::Cancelled`.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn raw_words(&mut self) -> Result<&mut RawWordsFile, CompressionError> {
        if self.compressed {
            return Err(CompressionError::AlreadyCompressed);
        }
        self.uncompressed_file
            .as_mut()
            .ok_or(CompressionError::AlreadyCompressed)
    }

    pub fn add_word(&mut self, word: &[u8]) -> Result<(), CompressionError> {
        self.raw_words()?.append(word)?;
        self.words_count += 1;
        self.raw_bytes += word.len() as u64;

        let l = superstring::encoded_len(word.len());
        if self.superstring_len + l > self.cfg.superstring_limit {
            if self.superstring_count % self.cfg.sampling_factor == 0 {
                self.ship_superstring()?;
            }
            self.superstring_count += 1;
            self.superstring_len = 0;
        }
        self.superstring_len += l;

        if self.superstring_count % self.cfg.sampling_factor == 0 {
            superstring::append_word(&mut self.superstring, word);
        }
        Ok(())
    }

    /// Adds a word that is stored verbatim, bypassing the pattern search.
    pub fn add_uncompressed_word(&mut self, word: &[u8]) -> Result<(), CompressionError> {
        self.raw_words()?.append_uncompressed(word)?;
        self.words_count += 1;
        self.raw_bytes += word.len() as u64;
        Ok(())
    }

    fn ship_superstring(&mut self) -> Result<(), CompressionError> {
        if self.superstring.is_empty() {
            return Ok(());
        }
        let ss = std::mem::replace(&mut self.superstring, Vec::with_capacity(1024 * 1024));
        let sent = match &self.superstring_tx {
            Some(tx) => tx.send(ss).is_ok(),
            None => false,
        };
        if !sent {
            // receivers are gone only when every worker has exited early
            self.join_analysis_workers()?;
            return Err(CompressionError::Invariant(
                "superstring workers exited early".to_string(),
            ));
        }
        Ok(())
    }

    fn join_analysis_workers(&mut self) -> Result<Vec<Collector>, CompressionError> {
        self.superstring_tx = None;
        let mut collectors = Vec::with_capacity(self.analysis_workers.len());
        let mut first_err = None;
        for handle in self.analysis_workers.drain(..) {
            match handle.join() {
                Ok(Ok(collector)) => collectors.push(collector),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(CompressionError::WorkerPanicked);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(collectors),
        }
    }

    fn check_cancelled(&self) -> Result<(), CompressionError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(CompressionError::Cancelled);
        }
        Ok(())
    }

    pub fn compress(&mut self) -> Result<(), CompressionError> {
        let start = Instant::now();
        self.raw_words()?.flush()?;
        self.ship_superstring()?;
        let collectors = self.join_analysis_workers()?;
        self.check_cancelled()?;

        log::log!(
            self.lvl,
            "[{}] BuildDict start workers={}",
            self.log_prefix,
            self.cfg.workers
        );
        let db = dictionary_builder_from_collectors(
            &self.log_prefix,
            &self.tmp_dir,
            collectors,
            self.cfg.max_dict_patterns,
            self.cfg.etl_buffer_size,
            &self.cancel,
        )?;
        if self.trace {
            let mut dict_path = self.output_file.clone().into_os_string();
            dict_path.push(".dictionary.txt");
            persist_dictionary(Path::new(&dict_path), &db)?;
        }
        log::log!(
            self.lvl,
            "[{}] BuildDict done patterns={} took={:?}",
            self.log_prefix,
            db.len(),
            start.elapsed()
        );
        self.check_cancelled()?;

        let result = self.write_output(&db);
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp_out_file_path);
        }
        result?;
        self.compressed = true;

        let out_size = fs::metadata(&self.output_file)?.len();
        self.ratio = if out_size == 0 {
            0.0
        } else {
            self.raw_bytes as f64 / out_size as f64
        };
        log::log!(
            self.lvl,
            "[{}] Compress took {:?} ratio={} file={}",
            self.log_prefix,
            start.elapsed(),
            ratio_to_string(self.ratio),
            self.file_name
        );
        Ok(())
    }

    fn write_output(
        &mut self,
        db: &crate::dictionary_builder::DictionaryBuilder,
    ) -> Result<(), CompressionError> {
        let cf = File::create(&self.tmp_out_file_path).map_err(|e| CompressionError::FileCreate {
            path: self.tmp_out_file_path.clone(),
            source: e,
        })?;
        let params = ReduceParams {
            trace: self.trace,
            cfg: &self.cfg,
            log_prefix: &self.log_prefix,
            lvl: self.lvl,
            tmp_dir: &self.tmp_dir,
            cancel: &self.cancel,
        };
        let raw_words = self
            .uncompressed_file
            .as_mut()
            .ok_or(CompressionError::AlreadyCompressed)?;
        let cf = reduce_dict(&params, db, raw_words, cf)?;
        self.fsync(&cf)?;
        drop(cf);

        fs::rename(&self.tmp_out_file_path, &self.output_file).map_err(|e| {
            CompressionError::FileRename {
                from: self.tmp_out_file_path.clone(),
                to: self.output_file.clone(),
                source: e,
            }
        })?;
        Ok(())
    }

    pub fn disable_fsync(&mut self) {
        self.no_fsync = true;
    }

    /// Raw bytes per output byte, available after `compress`.
    pub fn ratio(&self) -> CompressionRatio {
        self.ratio
    }

    fn fsync(&self, file: &File) -> Result<(), CompressionError> {
        if self.no_fsync {
            return Ok(());
        }
        file.sync_all()?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), CompressionError> {
        self.superstring_tx = None;
        // collectors of unfinished workers are dropped with their temp files
        for handle in self.analysis_workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(f) = self.uncompressed_file.take() {
            f.close_and_remove()?;
        }
        Ok(())
    }

    /// Releases the spool file and joins the analysis workers.
    pub fn close(mut self) -> Result<(), CompressionError> {
        self.cleanup()
    }
}

impl Drop for Compressor {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("[{}] cleanup failed: {}", self.log_prefix, e);
        }
    }
}

/// Spool of the words as added: varint `2*len` (`2*len+1` for words stored
/// verbatim) followed by the word bytes.
pub struct RawWordsFile {
    f: File,
    w: BufWriter<File>,
    pub file_path: PathBuf,
    buf: [u8; 10],
    pub count: u64,
}

impl RawWordsFile {
    pub fn new(file_path: impl AsRef<Path>) -> Result<Self, CompressionError> {
        let file_path = file_path.as_ref().to_path_buf();
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_path)
            .map_err(|e| CompressionError::FileCreate {
                path: file_path.clone(),
                source: e,
            })?;
        let w = BufWriter::new(f.try_clone()?);
        Ok(RawWordsFile {
            f,
            w,
            file_path,
            buf: [0; 10],
            count: 0,
        })
    }

    fn append_with_header(&mut self, header: u64, v: &[u8]) -> Result<(), CompressionError> {
        self.count += 1;
        let n = encode_varint(&mut self.buf, header);
        self.w.write_all(&self.buf[..n])?;
        self.w.write_all(v)?;
        Ok(())
    }

    pub fn append(&mut self, v: &[u8]) -> Result<(), CompressionError> {
        self.append_with_header(2 * v.len() as u64, v)
    }

    pub fn append_uncompressed(&mut self, v: &[u8]) -> Result<(), CompressionError> {
        self.append_with_header(2 * v.len() as u64 + 1, v)
    }

    pub fn flush(&mut self) -> Result<(), CompressionError> {
        self.w.flush()?;
        Ok(())
    }

    pub fn close_and_remove(mut self) -> Result<(), CompressionError> {
        self.w.flush()?;
        drop(self.w);
        drop(self.f);
        fs::remove_file(&self.file_path)?;
        Ok(())
    }

    /// Replays every word; the flag is false for words stored verbatim.
    pub fn for_each<F>(&mut self, mut walker: F) -> Result<(), CompressionError>
    where
        F: FnMut(&[u8], bool) -> Result<(), CompressionError>,
    {
        self.w.flush()?;
        self.f.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::with_capacity(8 * 1024 * 1024, &self.f);
        let mut buf = Vec::with_capacity(16 * 1024);
        loop {
            let l = match read_uvarint(&mut reader) {
                Ok(l) => l,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let compressed = l & 1 == 0;
            let l = (l >> 1) as usize;
            buf.resize(l, 0);
            reader.read_exact(&mut buf)?;
            walker(&buf, compressed)?;
        }
    }
}

/// Writes `x` as an unsigned LEB128 varint, returning the bytes used.
pub fn encode_varint(buf: &mut [u8], mut x: u64) -> usize {
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

pub fn put_uvarint(out: &mut Vec<u8>, x: u64) {
    let mut buf = [0u8; 10];
    let n = encode_varint(&mut buf, x);
    out.extend_from_slice(&buf[..n]);
}

pub fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

/// Decodes a varint from the front of `data`, returning the value and the
/// bytes consumed, or `None` when `data` ends early or the value overflows.
pub fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for (i, &b) in data.iter().enumerate() {
        if i == 10 || (i == 9 && b > 1) {
            return None;
        }
        if b < 0x80 {
            return Some((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    None
}

pub fn read_uvarint(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut x = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    for i in 0..10 {
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            // EOF in the middle of a varint is corruption, not a clean end
            Err(e) if i > 0 && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "truncated varint",
                ));
            }
            Err(e) => return Err(e),
        }
        if i == 9 && byte[0] > 1 {
            break;
        }
        if byte[0] < 0x80 {
            return Ok(x | (u64::from(byte[0]) << shift));
        }
        x |= u64::from(byte[0] & 0x7f) << shift;
        shift += 7;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "varint overflow",
    ))
}

#[cfg(test)]
#[path = "compress_test.rs"]
mod compress_test;
