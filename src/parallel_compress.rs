//! Pattern analysis workers and the reduction pass that covers every spooled
//! word with dictionary patterns and writes the segment file.

use crate::compress::{encode_varint, put_uvarint, read_uvarint, uvarint_len, Cfg, RawWordsFile};
use crate::dictionary_builder::DictionaryBuilder;
use crate::error::CompressionError;
use crate::etl::Collector;
use crate::huffman::{build_huffman, pattern_list_cmp, write_tree, BitWriter, HuffLeaf};
use crate::patricia::{MatchFinder, PatriciaTree};
use crate::superstring::{process_superstring, SuffixScratch};
use std::cmp::Ordering;
use std::collections::binary_heap::PeekMut;
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::Instant;

/// Index of a pattern in the dictionary, as stored in the trie.
pub type PatternIdx = u32;

/// Finished words waiting for an earlier word are capped at this many.
pub const COMPRESSION_QUEUE_LIMIT: usize = 128 * 1024;

const WORD_CHANNEL_SIZE: usize = 1024;

fn check_cancelled(cancel: &AtomicBool) -> Result<(), CompressionError> {
    if cancel.load(AtomicOrdering::Relaxed) {
        return Err(CompressionError::Cancelled);
    }
    Ok(())
}

/// Runs the suffix analysis over every superstring received on `rx` until the
/// channel closes, collecting `(pattern, big-endian score)` candidates.
pub fn superstring_worker(
    rx: &Mutex<Receiver<Vec<u8>>>,
    cfg: &Cfg,
    tmp_dir: &Path,
    log_prefix: &str,
    cancel: &AtomicBool,
) -> Result<Collector, CompressionError> {
    let mut collector = Collector::new(log_prefix, tmp_dir, cfg.etl_buffer_size);
    let mut scratch = SuffixScratch::default();
    loop {
        check_cancelled(cancel)?;
        let next = rx
            .lock()
            .map_err(|_| CompressionError::WorkerPanicked)?
            .recv();
        let Ok(superstring) = next else {
            break;
        };
        let start = Instant::now();
        process_superstring(&superstring, cfg, &mut scratch, |k, score| {
            collector.collect(k, &score.to_be_bytes())
        })?;
        log::debug!(
            "[{}] superstring of {} bytes analysed in {:?}, candidates={}",
            log_prefix,
            superstring.len(),
            start.elapsed(),
            collector.len()
        );
    }
    Ok(collector)
}

/// A dictionary pattern during the reduction pass.
#[derive(Debug)]
pub struct Pattern {
    pub word: Vec<u8>,
    pub score: u64,
    // how many times the cover chose this pattern
    pub uses: AtomicU64,
    pub code: u64,
    pub code_bits: usize,
}

impl Pattern {
    pub fn new(word: &[u8], score: u64) -> Self {
        Pattern {
            word: word.to_vec(),
            score,
            uses: AtomicU64::new(0),
            code: 0,
            code_bits: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicCell {
    pub optim_start: usize,
    pub cover_start: usize,
    pub compression: i64,
    pub score: u64,
    // offset of the head of this cell's pattern chain, 0 for none
    pub pattern_idx: usize,
}

/// Double-ended queue of cells, grown by doubling.
pub struct Ring {
    cells: Vec<DynamicCell>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl Ring {
    pub fn new() -> Self {
        Ring {
            cells: vec![DynamicCell::default(); 16],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.head = 0;
        self.tail = 0;
    }

    fn ensure_size(&mut self) {
        if self.count < self.cells.len() {
            return;
        }
        let mut new_cells = vec![DynamicCell::default(); self.count * 2];
        if self.tail > self.head {
            new_cells[..self.tail - self.head].copy_from_slice(&self.cells[self.head..self.tail]);
        } else {
            let n = self.cells.len() - self.head;
            new_cells[..n].copy_from_slice(&self.cells[self.head..]);
            new_cells[n..n + self.tail].copy_from_slice(&self.cells[..self.tail]);
        }
        self.head = 0;
        self.tail = self.count;
        self.cells = new_cells;
    }

    pub fn push_front(&mut self, cell: DynamicCell) {
        self.ensure_size();
        if self.head == 0 {
            self.head = self.cells.len();
        }
        self.head -= 1;
        self.count += 1;
        self.cells[self.head] = cell;
    }

    pub fn push_back(&mut self, cell: DynamicCell) {
        self.ensure_size();
        self.cells[self.tail] = cell;
        self.tail = (self.tail + 1) % self.cells.len();
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, i: usize) -> DynamicCell {
        debug_assert!(i < self.count, "ring index {} out of {}", i, self.count);
        self.cells[(self.head + i) % self.cells.len()]
    }

    /// Keeps the first `i` cells.
    pub fn truncate(&mut self, i: usize) {
        self.count = i;
        self.tail = (self.head + i) % self.cells.len();
    }
}

/// Per-worker state for turning words into intermediate records.
struct WordEncoder<'a> {
    trace: bool,
    mf: MatchFinder<'a, PatternIdx>,
    ring: Ring,
    // pairs of (match index, offset of the next pair); [0, 0] is a sentinel
    patterns: Vec<usize>,
    uncovered: Vec<usize>,
    pos_map: HashMap<u64, u64>,
}

impl<'a> WordEncoder<'a> {
    fn new(trace: bool, pt: &'a PatriciaTree<PatternIdx>) -> Self {
        WordEncoder {
            trace,
            mf: MatchFinder::new(pt),
            ring: Ring::new(),
            patterns: Vec::with_capacity(256),
            uncovered: Vec::with_capacity(256),
            pos_map: HashMap::new(),
        }
    }

    /// Appends the intermediate record of `word` to `out`: varint length and,
    /// for a non-empty word, its pattern cover followed by the bytes left
    /// uncovered. Words that skip compression get an empty cover.
    fn encode(&mut self, word: &[u8], compress: bool, code2pattern: &[Pattern], out: &mut Vec<u8>) {
        put_uvarint(out, word.len() as u64);
        *self.pos_map.entry(word.len() as u64 + 1).or_insert(0) += 1;
        *self.pos_map.entry(0).or_insert(0) += 1;
        if word.is_empty() {
            return;
        }
        if compress {
            self.optimise_cluster(word, code2pattern, out);
        } else {
            out.push(0);
            out.extend_from_slice(word);
        }
    }

    /// Picks the subset of matches giving the largest saving, assuming each
    /// used pattern costs four bytes of codes. Equal savings prefer the
    /// higher total pattern score.
    fn optimise_cluster(&mut self, input: &[u8], code2pattern: &[Pattern], out: &mut Vec<u8>) {
        let WordEncoder {
            trace,
            mf,
            ring,
            patterns,
            uncovered,
            pos_map,
        } = self;
        let matches = mf.find_longest_matches(input);
        let Some(last) = matches.last() else {
            out.push(0);
            out.extend_from_slice(input);
            return;
        };

        ring.reset();
        patterns.clear();
        patterns.extend_from_slice(&[0, 0]);
        for j in last.start..last.end {
            ring.push_back(DynamicCell {
                optim_start: j + 1,
                cover_start: input.len(),
                ..Default::default()
            });
        }

        for i in (0..matches.len()).rev() {
            let f = matches[i];
            let p = &code2pattern[f.val as usize];
            let first = ring.get(0);
            let mut max_compression = first.compression;
            let mut max_score = first.score;
            let mut max_cell = first;
            let mut max_include = false;
            for e in 0..ring.len() {
                let cell = ring.get(e);
                let covered = cell.cover_start.min(f.end) as i64 - f.start as i64;
                let comp = cell.compression - 4 + covered;
                let score = cell.score.saturating_add(p.score);
                if comp > max_compression || (comp == max_compression && score > max_score) {
                    max_compression = comp;
                    max_score = score;
                    max_include = true;
                    max_cell = cell;
                } else if cell.optim_start > f.end {
                    ring.truncate(e);
                    break;
                }
            }

            let cell = if max_include {
                let pattern_idx = patterns.len();
                patterns.push(i);
                patterns.push(max_cell.pattern_idx);
                DynamicCell {
                    optim_start: f.start,
                    cover_start: f.start,
                    compression: max_compression,
                    score: max_score,
                    pattern_idx,
                }
            } else {
                DynamicCell {
                    optim_start: f.start,
                    cover_start: max_cell.cover_start,
                    compression: max_compression,
                    score: max_score,
                    pattern_idx: max_cell.pattern_idx,
                }
            };
            ring.push_front(cell);
        }

        let optim = ring.get(0);
        let mut pattern_count = 0u64;
        let mut idx = optim.pattern_idx;
        while idx != 0 {
            pattern_count += 1;
            idx = patterns[idx + 1];
        }
        put_uvarint(out, pattern_count);

        uncovered.clear();
        let mut last_start = 0;
        let mut last_uncovered = 0;
        idx = optim.pattern_idx;
        while idx != 0 {
            let m = matches[patterns[idx]];
            let p = &code2pattern[m.val as usize];
            if *trace {
                log::trace!(
                    "cover [{}..{}) with pattern {} {}",
                    m.start,
                    m.end,
                    m.val,
                    hex::encode(&p.word)
                );
            }
            if m.start > last_uncovered {
                uncovered.push(last_uncovered);
                uncovered.push(m.start);
            }
            last_uncovered = m.end;
            *pos_map.entry((m.start - last_start + 1) as u64).or_insert(0) += 1;
            last_start = m.start;
            put_uvarint(out, m.start as u64);
            put_uvarint(out, u64::from(m.val));
            p.uses.fetch_add(1, AtomicOrdering::Relaxed);
            idx = patterns[idx + 1];
        }
        if input.len() > last_uncovered {
            uncovered.push(last_uncovered);
            uncovered.push(input.len());
        }
        for span in uncovered.chunks_exact(2) {
            out.extend_from_slice(&input[span[0]..span[1]]);
        }
    }
}

/// A word travelling through the worker pool, tagged with its input order.
#[derive(Debug)]
pub struct CompressionWord {
    pub word: Vec<u8>,
    pub order: u64,
}

impl CompressionWord {
    pub fn new(word: Vec<u8>, order: u64) -> Self {
        CompressionWord { word, order }
    }
}

// BinaryHeap is a max-heap; the lowest order must come out first
impl Ord for CompressionWord {
    fn cmp(&self, other: &Self) -> Ordering {
        other.order.cmp(&self.order)
    }
}

impl PartialOrd for CompressionWord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CompressionWord {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for CompressionWord {}

pub type CompressionQueue = BinaryHeap<CompressionWord>;

/// Writes out every queued word whose turn has come.
fn write_ready<W: Write>(
    queue: &mut CompressionQueue,
    out_count: &mut u64,
    w: &mut W,
) -> io::Result<()> {
    while let Some(top) = queue.peek_mut() {
        if top.order != *out_count {
            break;
        }
        let top = PeekMut::pop(top);
        w.write_all(&top.word)?;
        *out_count += 1;
    }
    Ok(())
}

pub struct ReduceParams<'a> {
    pub trace: bool,
    pub cfg: &'a Cfg,
    pub log_prefix: &'a str,
    pub lvl: log::Level,
    pub tmp_dir: &'a Path,
    pub cancel: &'a AtomicBool,
}

/// Covers every spooled word with the dictionary, builds the pattern and
/// position codes from the observed usage and writes the segment into `cf`.
pub fn reduce_dict(
    params: &ReduceParams<'_>,
    db: &DictionaryBuilder,
    raw_words: &mut RawWordsFile,
    cf: File,
) -> Result<File, CompressionError> {
    let start = Instant::now();
    let mut code2pattern: Vec<Pattern> = Vec::with_capacity(db.len());
    let mut pt = PatriciaTree::new();
    db.for_each(|score, word| {
        pt.insert(word, code2pattern.len() as PatternIdx);
        code2pattern.push(Pattern::new(word, score));
    });
    log::debug!(
        "[{}] dictionary trie built, patterns={}",
        params.log_prefix,
        code2pattern.len()
    );

    let intermediate =
        tempfile::tempfile_in(params.tmp_dir).map_err(|e| CompressionError::FileCreate {
            path: params.tmp_dir.to_path_buf(),
            source: e,
        })?;
    let mut inter_w = BufWriter::with_capacity(1024 * 1024, intermediate);
    let (pos_map, words_count) = if params.cfg.workers > 1 {
        encode_words_parallel(params, &pt, &code2pattern, raw_words, &mut inter_w)?
    } else {
        encode_words(params, &pt, &code2pattern, raw_words, &mut inter_w)?
    };
    let mut intermediate = inter_w.into_inner().map_err(|e| e.into_error())?;
    intermediate.seek(SeekFrom::Start(0))?;
    log::log!(
        params.lvl,
        "[{}] Dictionary cover done words={} took={:?}",
        params.log_prefix,
        words_count,
        start.elapsed()
    );

    write_segment(params, &mut code2pattern, &pos_map, words_count, intermediate, cf)
}

fn encode_words<W: Write>(
    params: &ReduceParams<'_>,
    pt: &PatriciaTree<PatternIdx>,
    code2pattern: &[Pattern],
    raw_words: &mut RawWordsFile,
    w: &mut W,
) -> Result<(HashMap<u64, u64>, u64), CompressionError> {
    let mut enc = WordEncoder::new(params.trace, pt);
    let mut out = Vec::with_capacity(256);
    let mut count = 0u64;
    raw_words.for_each(|v, compressed| {
        check_cancelled(params.cancel)?;
        out.clear();
        enc.encode(v, compressed, code2pattern, &mut out);
        w.write_all(&out)?;
        count += 1;
        if count % 1_000_000 == 0 {
            log::log!(params.lvl, "[{}] Covered words={}", params.log_prefix, count);
        }
        Ok(())
    })?;
    Ok((enc.pos_map, count))
}

fn compression_worker(
    params: &ReduceParams<'_>,
    pt: &PatriciaTree<PatternIdx>,
    code2pattern: &[Pattern],
    in_rx: &Mutex<Receiver<CompressionWord>>,
    out_tx: SyncSender<CompressionWord>,
) -> Result<HashMap<u64, u64>, CompressionError> {
    let mut enc = WordEncoder::new(params.trace, pt);
    loop {
        check_cancelled(params.cancel)?;
        let next = in_rx
            .lock()
            .map_err(|_| CompressionError::WorkerPanicked)?
            .recv();
        let Ok(mut word) = next else {
            break;
        };
        let mut out = Vec::with_capacity(word.word.len() + 16);
        enc.encode(&word.word, true, code2pattern, &mut out);
        word.word = out;
        if out_tx.send(word).is_err() {
            // the writer gave up
            break;
        }
    }
    Ok(enc.pos_map)
}

fn workers_gone() -> CompressionError {
    CompressionError::Invariant("compression workers exited early".to_string())
}

/// Feeds words to the pool and writes results back in input order. Empty and
/// verbatim words are encoded here without a round trip through the pool.
fn feed_words<W: Write>(
    params: &ReduceParams<'_>,
    enc: &mut WordEncoder<'_>,
    code2pattern: &[Pattern],
    raw_words: &mut RawWordsFile,
    in_tx: SyncSender<CompressionWord>,
    out_rx: &Receiver<CompressionWord>,
    w: &mut W,
) -> Result<u64, CompressionError> {
    let mut queue = CompressionQueue::new();
    let mut in_count = 0u64;
    let mut out_count = 0u64;
    raw_words.for_each(|v, compressed| {
        check_cancelled(params.cancel)?;
        let order = in_count;
        in_count += 1;
        if compressed && !v.is_empty() {
            let mut word = CompressionWord::new(v.to_vec(), order);
            loop {
                match in_tx.try_send(word) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        // drain results so blocked workers can take more input
                        word = back;
                        queue.push(out_rx.recv().map_err(|_| workers_gone())?);
                        write_ready(&mut queue, &mut out_count, w)?;
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(workers_gone()),
                }
            }
        } else {
            let mut out = Vec::with_capacity(v.len() + 2);
            enc.encode(v, false, code2pattern, &mut out);
            queue.push(CompressionWord::new(out, order));
        }

        while let Ok(done) = out_rx.try_recv() {
            queue.push(done);
        }
        write_ready(&mut queue, &mut out_count, w)?;
        while queue.len() >= COMPRESSION_QUEUE_LIMIT {
            queue.push(out_rx.recv().map_err(|_| workers_gone())?);
            write_ready(&mut queue, &mut out_count, w)?;
        }
        if in_count % 1_000_000 == 0 {
            log::log!(
                params.lvl,
                "[{}] Covered words={} queued={}",
                params.log_prefix,
                out_count,
                queue.len()
            );
        }
        Ok(())
    })?;
    drop(in_tx);

    while out_count < in_count {
        check_cancelled(params.cancel)?;
        queue.push(out_rx.recv().map_err(|_| workers_gone())?);
        write_ready(&mut queue, &mut out_count, w)?;
    }
    Ok(in_count)
}

fn encode_words_parallel<W: Write>(
    params: &ReduceParams<'_>,
    pt: &PatriciaTree<PatternIdx>,
    code2pattern: &[Pattern],
    raw_words: &mut RawWordsFile,
    w: &mut W,
) -> Result<(HashMap<u64, u64>, u64), CompressionError> {
    let workers = params.cfg.workers;
    let (in_tx, in_rx) = sync_channel::<CompressionWord>(WORD_CHANNEL_SIZE);
    let in_rx = Mutex::new(in_rx);
    let (out_tx, out_rx) = sync_channel::<CompressionWord>(WORD_CHANNEL_SIZE);

    std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(workers);
        let mut spawn_err = None;
        for i in 0..workers {
            let out_tx = out_tx.clone();
            let in_rx = &in_rx;
            let spawned = std::thread::Builder::new()
                .name(format!("compress-{}", i))
                .spawn_scoped(s, move || {
                    compression_worker(params, pt, code2pattern, in_rx, out_tx)
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    spawn_err = Some(e);
                    break;
                }
            }
        }
        drop(out_tx);

        let mut enc = WordEncoder::new(params.trace, pt);
        let fed = match spawn_err {
            Some(e) => {
                drop(in_tx);
                Err(CompressionError::Io(e))
            }
            None => feed_words(params, &mut enc, code2pattern, raw_words, in_tx, &out_rx, w),
        };
        // unblocks workers still sending
        drop(out_rx);

        let mut pos_map = std::mem::take(&mut enc.pos_map);
        let mut errors = Vec::new();
        for h in handles {
            match h.join() {
                Ok(Ok(worker_map)) => {
                    for (pos, uses) in worker_map {
                        *pos_map.entry(pos).or_insert(0) += uses;
                    }
                }
                Ok(Err(e)) => errors.push(e),
                Err(_) => errors.push(CompressionError::WorkerPanicked),
            }
        }
        let words_count = match fed {
            Ok(n) => n,
            Err(e) => {
                errors.push(e);
                0
            }
        };
        // a worker's own failure explains the writer's, and both beat a cancel
        if let Some(i) = errors
            .iter()
            .position(|e| !matches!(e, CompressionError::Cancelled))
        {
            return Err(errors.swap_remove(i));
        }
        if let Some(e) = errors.pop() {
            return Err(e);
        }
        Ok((pos_map, words_count))
    })
}

fn write_segment(
    params: &ReduceParams<'_>,
    code2pattern: &mut [Pattern],
    pos_map: &HashMap<u64, u64>,
    words_count: u64,
    intermediate: File,
    cf: File,
) -> Result<File, CompressionError> {
    let uses = |p: &Pattern| p.uses.load(AtomicOrdering::Relaxed);
    let mut pattern_list: Vec<usize> = (0..code2pattern.len())
        .filter(|&i| uses(&code2pattern[i]) > 0)
        .collect();
    pattern_list.sort_by(|&a, &b| {
        pattern_list_cmp(
            (uses(&code2pattern[a]), a as u64),
            (uses(&code2pattern[b]), b as u64),
        )
    });
    let leaves: Vec<HuffLeaf> = pattern_list
        .iter()
        .map(|&i| {
            let p = &code2pattern[i];
            HuffLeaf {
                uses: uses(p),
                size: (uvarint_len(p.word.len() as u64) + p.word.len()) as u64,
            }
        })
        .collect();
    let pattern_codes = build_huffman(&leaves)?;
    for (k, &i) in pattern_list.iter().enumerate() {
        let (code, code_bits) = pattern_codes.codes[k];
        code2pattern[i].code = code;
        code2pattern[i].code_bits = code_bits;
    }
    log::log!(
        params.lvl,
        "[{}] Effective dictionary patterns={} max_depth={}",
        params.log_prefix,
        pattern_list.len(),
        pattern_codes.depth()
    );

    let mut position_list: Vec<(u64, u64)> = pos_map.iter().map(|(&p, &u)| (p, u)).collect();
    position_list.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let leaves: Vec<HuffLeaf> = position_list
        .iter()
        .map(|&(pos, uses)| HuffLeaf {
            uses,
            size: uvarint_len(pos) as u64,
        })
        .collect();
    let pos_codes = build_huffman(&leaves)?;
    let pos2code: HashMap<u64, (u64, usize)> = position_list
        .iter()
        .zip(&pos_codes.codes)
        .map(|(&(pos, _), &code)| (pos, code))
        .collect();
    log::log!(
        params.lvl,
        "[{}] Positional dictionary positions={} max_depth={}",
        params.log_prefix,
        position_list.len(),
        pos_codes.depth()
    );

    let mut w = BufWriter::with_capacity(1024 * 1024, cf);
    w.write_all(&words_count.to_be_bytes())?;
    let mut num_buf = [0u8; 10];
    write_tree(&mut w, &pattern_codes, |w, k| {
        let word = &code2pattern[pattern_list[k]].word;
        let n = encode_varint(&mut num_buf, word.len() as u64);
        w.write_all(&num_buf[..n])?;
        w.write_all(word)
    })?;
    write_tree(&mut w, &pos_codes, |w, k| {
        let n = encode_varint(&mut num_buf, position_list[k].0);
        w.write_all(&num_buf[..n])
    })?;

    let pos_code = |pos: u64| {
        pos2code.get(&pos).copied().ok_or_else(|| {
            CompressionError::Invariant(format!("position {} has no code", pos))
        })
    };
    let mut r = BufReader::with_capacity(1024 * 1024, intermediate);
    let mut hc = BitWriter::new(w);
    for _ in 0..words_count {
        check_cancelled(params.cancel)?;
        let l = read_uvarint(&mut r)?;
        let (code, bits) = pos_code(l + 1)?;
        hc.encode(code, bits)?;
        if l == 0 {
            hc.flush()?;
            continue;
        }

        let pattern_count = read_uvarint(&mut r)?;
        let mut last_pos = 0u64;
        let mut last_uncovered = 0u64;
        let mut uncovered_count = 0u64;
        for _ in 0..pattern_count {
            let pos = read_uvarint(&mut r)?;
            let idx = read_uvarint(&mut r)? as usize;
            let delta = pos.checked_sub(last_pos).ok_or_else(|| {
                CompressionError::Invariant(format!("pattern at {} before {}", pos, last_pos))
            })?;
            let (code, bits) = pos_code(delta + 1)?;
            hc.encode(code, bits)?;
            last_pos = pos;

            let p = code2pattern.get(idx).ok_or_else(|| {
                CompressionError::Invariant(format!("pattern index {} out of range", idx))
            })?;
            hc.encode(p.code, p.code_bits)?;
            if pos > last_uncovered {
                uncovered_count += pos - last_uncovered;
            }
            last_uncovered = pos + p.word.len() as u64;
        }
        if l > last_uncovered {
            uncovered_count += l - last_uncovered;
        }
        let (code, bits) = pos_code(0)?;
        hc.encode(code, bits)?;
        hc.flush()?;

        let copied = io::copy(&mut (&mut r).take(uncovered_count), hc.get_mut())?;
        if copied != uncovered_count {
            return Err(CompressionError::Invariant(format!(
                "intermediate file ended {} bytes early",
                uncovered_count - copied
            )));
        }
    }

    let cf = hc.into_inner().into_inner().map_err(|e| e.into_error())?;
    Ok(cf)
}
