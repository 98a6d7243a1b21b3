//! Top-K dictionary selection over the merged pattern candidates.

use crate::error::CompressionError;
use crate::etl::Collector;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// A candidate pattern with its accumulated score.
#[derive(Debug, Clone)]
pub struct DictItem {
    pub word: Vec<u8>,
    pub score: u64,
}

// Reversed so that BinaryHeap pops the lowest score first, and among equal
// scores the lexicographically smallest word.
impl Ord for DictItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| other.word.cmp(&self.word))
    }
}

impl PartialOrd for DictItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DictItem {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.word == other.word
    }
}

impl Eq for DictItem {}

fn decode_score(v: &[u8]) -> Result<u64, CompressionError> {
    let bytes: [u8; 8] = v.try_into().map_err(|_| {
        CompressionError::Collector(format!("score value has {} bytes, expected 8", v.len()))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

pub struct DictionaryBuilder {
    limit: usize,
    last_word: Option<Vec<u8>>,
    last_word_score: u64,
    heap: BinaryHeap<DictItem>,
    // ascending by (score, word) once finished
    items: Vec<DictItem>,
}

impl DictionaryBuilder {
    pub fn new(limit: usize) -> Self {
        DictionaryBuilder {
            limit,
            last_word: None,
            last_word_score: 0,
            heap: BinaryHeap::new(),
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len() + self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn process_word(&mut self, chars: &[u8], score: u64) {
        self.heap.push(DictItem {
            word: chars.to_vec(),
            score,
        });
        if self.heap.len() > self.limit {
            self.heap.pop();
        }
    }

    /// Consumes one entry of the key-sorted candidate stream. Scores of
    /// adjacent identical keys are summed before the pattern is offered to
    /// the heap.
    pub fn load_func(&mut self, k: &[u8], v: &[u8]) -> Result<(), CompressionError> {
        let score = decode_score(v)?;
        if self.last_word.as_deref() == Some(k) {
            self.last_word_score += score;
            return Ok(());
        }
        if let Some(last) = self.last_word.take() {
            self.process_word(&last, self.last_word_score);
        }
        self.last_word = Some(k.to_vec());
        self.last_word_score = score;
        Ok(())
    }

    /// Flushes the pending pattern and fixes the final order.
    pub fn finish(&mut self) {
        if let Some(last) = self.last_word.take() {
            self.process_word(&last, self.last_word_score);
        }
        self.items.extend(self.heap.drain());
        self.items
            .sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.word.cmp(&b.word)));
    }

    /// Patterns from the highest score down.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u64, &[u8]),
    {
        for item in self.items.iter().rev() {
            f(item.score, &item.word);
        }
    }
}

/// Merges the key-sorted output of several collectors into one collector,
/// summing the scores of identical patterns.
pub struct DictAggregator {
    collector: Collector,
    last_word: Option<Vec<u8>>,
    last_word_score: u64,
    // pattern length distribution, for logging
    dist: BTreeMap<usize, u64>,
}

impl DictAggregator {
    pub fn new(collector: Collector) -> Self {
        DictAggregator {
            collector,
            last_word: None,
            last_word_score: 0,
            dist: BTreeMap::new(),
        }
    }

    fn process_word(&mut self, word: &[u8], score: u64) -> Result<(), CompressionError> {
        self.collector.collect(word, &score.to_be_bytes())
    }

    pub fn agg_load_func(&mut self, k: &[u8], v: &[u8]) -> Result<(), CompressionError> {
        *self.dist.entry(k.len()).or_insert(0) += 1;
        let score = decode_score(v)?;
        if self.last_word.as_deref() == Some(k) {
            self.last_word_score += score;
            return Ok(());
        }
        if let Some(last) = self.last_word.take() {
            self.process_word(&last, self.last_word_score)?;
        }
        self.last_word = Some(k.to_vec());
        self.last_word_score = score;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(Collector, BTreeMap<usize, u64>), CompressionError> {
        if let Some(last) = self.last_word.take() {
            self.process_word(&last, self.last_word_score)?;
        }
        Ok((self.collector, self.dist))
    }
}

pub fn dictionary_builder_from_collectors(
    log_prefix: &str,
    tmp_dir: &Path,
    collectors: Vec<Collector>,
    limit: usize,
    etl_buffer_size: usize,
    cancel: &AtomicBool,
) -> Result<DictionaryBuilder, CompressionError> {
    let mut agg = DictAggregator::new(Collector::new(log_prefix, tmp_dir, etl_buffer_size));
    for collector in collectors {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(CompressionError::Cancelled);
        }
        collector.load(|k, v| agg.agg_load_func(k, v))?;
    }
    let (dict_collector, dist) = agg.finish()?;
    if log::log_enabled!(log::Level::Debug) {
        log::debug!(
            "[{}] dictionary candidates by length: {:?}",
            log_prefix,
            dist
        );
    }

    if cancel.load(AtomicOrdering::Relaxed) {
        return Err(CompressionError::Cancelled);
    }
    let mut db = DictionaryBuilder::new(limit);
    dict_collector.load(|k, v| db.load_func(k, v))?;
    db.finish();
    Ok(db)
}

/// Writes the dictionary as `<score> <hex pattern>` lines, highest score first.
pub fn persist_dictionary(path: &Path, db: &DictionaryBuilder) -> Result<(), CompressionError> {
    let f = File::create(path).map_err(|e| CompressionError::FileCreate {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut w = BufWriter::new(f);
    let mut res = Ok(());
    db.for_each(|score, word| {
        if res.is_ok() {
            res = writeln!(w, "{} {}", score, hex::encode(word));
        }
    });
    res?;
    w.flush()?;
    Ok(())
}
