//! Reader for segment files: rebuilds the pattern and position decode tables
//! from the file header and serves words through `Getter` cursors over the
//! memory-mapped word stream.

use crate::compress::decode_uvarint;
use crate::error::DecompressionError;
use lazy_static::lazy_static;
use memmap2::{Mmap, MmapOptions};
use std::cmp::Ordering;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Code lengths beyond this are treated as a corrupt file.
pub const MAX_ALLOWED_DEPTH: u64 = 2048;

/// Pattern tables wider than this are stored as lists instead of arrays.
pub const CONDENSE_PATTERN_TABLE_BIT_THRESHOLD: usize = 9;

const MAX_TABLE_BITS: usize = 9;

// word count, pattern section size, root offset, cutoff
const HEADER_SIZE: usize = 32;

// position section size, root offset, cutoff
const POS_HEADER_SIZE: usize = 24;

lazy_static! {
    /// For each code length `l`, the multiples of `2^l` below 512. A code of
    /// length `l` stored in a condensed table matches every 9-bit window
    /// whose distance from it is in this list.
    static ref CONDENSED_WORD_DISTANCES: Vec<Vec<u16>> = (0..=MAX_TABLE_BITS)
        .map(|l| {
            if l == 0 {
                Vec::new()
            } else {
                ((1u16 << l)..512).step_by(1 << l).collect()
            }
        })
        .collect();
}

fn check_distance(len: u8, d: u16) -> bool {
    CONDENSED_WORD_DISTANCES
        .get(len as usize)
        .is_some_and(|dists| dists.binary_search(&d).is_ok())
}

#[derive(Debug, Clone)]
pub struct DecompressorCfg {
    pub condense_pattern_table_bit_threshold: usize,
}

impl Default for DecompressorCfg {
    fn default() -> Self {
        DecompressorCfg {
            condense_pattern_table_bit_threshold: CONDENSE_PATTERN_TABLE_BIT_THRESHOLD,
        }
    }
}

/// Location of a pattern's bytes inside the mapped file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PatternRef {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
enum Entry<T> {
    Leaf(T),
    // index of the child table
    Table(u32),
}

#[derive(Debug, Clone, Copy)]
struct CodeWord<T> {
    code: u16,
    // bits consumed for a leaf
    len: u8,
    entry: Entry<T>,
}

#[derive(Debug)]
enum Slots<T> {
    Flat(Vec<Option<CodeWord<T>>>),
    Condensed(Vec<CodeWord<T>>),
}

#[derive(Debug)]
struct Table<T> {
    bit_len: usize,
    slots: Slots<T>,
}

impl<T: Copy> Table<T> {
    fn new(bit_len: usize, threshold: usize) -> Self {
        let slots = if bit_len <= threshold {
            Slots::Flat(vec![None; 1 << bit_len])
        } else {
            Slots::Condensed(Vec::new())
        };
        Table { bit_len, slots }
    }

    fn insert(&mut self, cw: CodeWord<T>) {
        match &mut self.slots {
            Slots::Flat(slots) => {
                // a short code owns every slot whose low bits equal it
                let step = 1usize << cw.len;
                let from = cw.code as usize;
                let to = if self.bit_len != cw.len as usize && cw.len > 0 {
                    from | (1 << self.bit_len)
                } else {
                    from + step
                };
                for c in (from..to).step_by(step) {
                    slots[c] = Some(cw);
                }
            }
            Slots::Condensed(list) => list.push(cw),
        }
    }

    fn lookup(&self, code: u16) -> Option<&CodeWord<T>> {
        match &self.slots {
            Slots::Flat(slots) => slots.get(code as usize)?.as_ref(),
            Slots::Condensed(list) => list.iter().find(|cw| {
                if cw.code == code {
                    return true;
                }
                let d = code.wrapping_sub(cw.code);
                d & 1 == 0 && check_distance(cw.len, d)
            }),
        }
    }
}

/// Tree of lookup tables, each resolving up to nine bits of a code.
#[derive(Debug)]
struct DecodeTables<T> {
    tables: Vec<Table<T>>,
    max_depth: u64,
    len: usize,
}

struct TableBuilder<'l, T> {
    leaves: &'l [(u64, T)],
    cursor: usize,
    threshold: usize,
    tables: Vec<Table<T>>,
}

impl<'l, T: Copy> TableBuilder<'l, T> {
    fn new_table(&mut self, max_depth: u64) -> usize {
        let bit_len = max_depth.min(MAX_TABLE_BITS as u64) as usize;
        self.tables.push(Table::new(bit_len, self.threshold));
        self.tables.len() - 1
    }

    fn fill(
        &mut self,
        table: usize,
        code: u16,
        bits: usize,
        depth: u64,
        max_depth: u64,
    ) -> Result<(), DecompressionError> {
        let Some(&(leaf_depth, payload)) = self.leaves.get(self.cursor) else {
            return Ok(());
        };
        if leaf_depth < depth {
            return Err(DecompressionError::InvalidFormat(format!(
                "code of depth {} found below depth {}",
                leaf_depth, depth
            )));
        }
        if leaf_depth == depth {
            self.tables[table].insert(CodeWord {
                code,
                len: bits as u8,
                entry: Entry::Leaf(payload),
            });
            self.cursor += 1;
            return Ok(());
        }
        if bits == MAX_TABLE_BITS {
            let child = self.new_table(max_depth);
            self.tables[table].insert(CodeWord {
                code,
                len: 0,
                entry: Entry::Table(child as u32),
            });
            return self.fill(child, 0, 0, depth, max_depth);
        }
        if max_depth == 0 {
            return Err(DecompressionError::InvalidFormat(
                "code lengths do not form a complete tree".to_string(),
            ));
        }
        self.fill(table, code, bits + 1, depth + 1, max_depth - 1)?;
        self.fill(table, (1 << bits) | code, bits + 1, depth + 1, max_depth - 1)
    }
}

impl<T: Copy> DecodeTables<T> {
    /// `leaves` are `(code length, payload)` in tree order, branch 0 first.
    fn build(leaves: &[(u64, T)], threshold: usize) -> Result<Self, DecompressionError> {
        let max_depth = leaves.iter().map(|&(d, _)| d).max().unwrap_or(0);
        let mut builder = TableBuilder {
            leaves,
            cursor: 0,
            threshold,
            tables: Vec::new(),
        };
        if !leaves.is_empty() {
            let root = builder.new_table(max_depth);
            builder.fill(root, 0, 0, 0, max_depth)?;
            if builder.cursor != leaves.len() {
                return Err(DecompressionError::InvalidFormat(format!(
                    "{} of {} codes left over after building tables",
                    leaves.len() - builder.cursor,
                    leaves.len()
                )));
            }
        }
        Ok(DecodeTables {
            tables: builder.tables,
            max_depth,
            len: leaves.len(),
        })
    }

    /// Decodes one code starting at bit `bit` of `data[p]`, advancing both.
    fn decode(&self, data: &[u8], p: &mut usize, bit: &mut usize) -> Result<T, &'static str> {
        let mut table = self.tables.first().ok_or("no codes in table")?;
        loop {
            let code = if table.bit_len == 0 {
                0
            } else {
                let b0 = *data.get(*p).ok_or("unexpected end of data")?;
                let mut code = u16::from(b0) >> *bit;
                if 8 - *bit < table.bit_len {
                    if let Some(&b1) = data.get(*p + 1) {
                        code |= u16::from(b1) << (8 - *bit);
                    }
                }
                code & ((1u16 << table.bit_len) - 1)
            };
            let cw = table.lookup(code).ok_or("code not found in table")?;
            let consumed = match cw.entry {
                Entry::Leaf(_) => cw.len as usize,
                Entry::Table(_) => table.bit_len,
            };
            *bit += consumed;
            *p += *bit / 8;
            *bit %= 8;
            match cw.entry {
                Entry::Leaf(v) => return Ok(v),
                Entry::Table(id) => {
                    table = self.tables.get(id as usize).ok_or("dangling table")?;
                }
            }
        }
    }
}

/// Walks a serialized offset tree and returns its leaves as
/// `(depth, leaf offset)` in tree order, branch 0 first.
fn tree_leaves(
    region: &[u8],
    root: u64,
    cutoff: u64,
    tree: &'static str,
) -> Result<Vec<(u64, usize)>, DecompressionError> {
    let invalid = |msg: String| DecompressionError::InvalidFormat(format!("{} tree: {}", tree, msg));
    let mut leaves = Vec::new();
    if region.is_empty() {
        return Ok(leaves);
    }
    if cutoff > region.len() as u64 || root >= region.len() as u64 {
        return Err(invalid(format!(
            "root {} or cutoff {} outside section of {} bytes",
            root,
            cutoff,
            region.len()
        )));
    }

    let mut stack = vec![(root, 0u64)];
    let mut visited = 0usize;
    while let Some((offset, depth)) = stack.pop() {
        // every node of a real tree has its own bytes
        visited += 1;
        if visited > region.len() {
            return Err(invalid("nodes are shared between branches".to_string()));
        }
        if depth > MAX_ALLOWED_DEPTH {
            return Err(DecompressionError::DepthExceeded {
                tree,
                depth,
                max: MAX_ALLOWED_DEPTH,
            });
        }
        if offset < cutoff {
            leaves.push((depth, offset as usize));
            continue;
        }
        let at = offset as usize;
        let (c0, n) = decode_uvarint(&region[at..])
            .ok_or_else(|| invalid(format!("bad child offset at {}", at)))?;
        let (c1, _) = decode_uvarint(&region[at + n..])
            .ok_or_else(|| invalid(format!("bad child offset at {}", at + n)))?;
        if c0 >= offset || c1 >= offset {
            return Err(invalid(format!("node at {} points forward", offset)));
        }
        stack.push((c1, depth + 1));
        stack.push((c0, depth + 1));
    }
    Ok(leaves)
}

fn read_u64(data: &[u8], at: usize, what: &str) -> Result<u64, DecompressionError> {
    data.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| {
            DecompressionError::InvalidFormat(format!("{} at offset {} is past the end", what, at))
        })
}

fn section_end(start: usize, size: u64, total: usize, what: &str) -> Result<usize, DecompressionError> {
    match (start as u64).checked_add(size) {
        Some(end) if end <= total as u64 => Ok(end as usize),
        _ => Err(DecompressionError::InvalidFormat(format!(
            "{} of {} bytes at offset {} exceeds file size {}",
            what, size, start, total
        ))),
    }
}

/// Read-only view of a segment file, shared by any number of getters.
#[derive(Debug)]
pub struct Decompressor {
    file_path: PathBuf,
    mmap: Mmap,
    words_count: u64,
    dict: DecodeTables<PatternRef>,
    pos_dict: DecodeTables<u64>,
    words_start: usize,
}

impl Decompressor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DecompressionError> {
        Self::open_with_cfg(path, DecompressorCfg::default())
    }

    pub fn open_with_cfg(
        path: impl AsRef<Path>,
        cfg: DecompressorCfg,
    ) -> Result<Self, DecompressionError> {
        let file_path = path.as_ref().to_path_buf();
        let file = File::open(&file_path).map_err(|e| DecompressionError::FileOpen {
            path: file_path.clone(),
            source: e,
        })?;
        let size = file.metadata()?.len();
        if size < (HEADER_SIZE + POS_HEADER_SIZE) as u64 {
            return Err(DecompressionError::FileTooShort {
                path: file_path,
                size,
            });
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let data = &mmap[..];

        let words_count = read_u64(data, 0, "word count")?;
        let dict_size = read_u64(data, 8, "pattern section size")?;
        let pattern_root = read_u64(data, 16, "pattern root")?;
        let pattern_cutoff = read_u64(data, 24, "pattern cutoff")?;
        let dict_end = section_end(HEADER_SIZE, dict_size, data.len(), "pattern section")?;
        let region = &data[HEADER_SIZE..dict_end];
        let mut patterns = Vec::new();
        for (depth, at) in tree_leaves(region, pattern_root, pattern_cutoff, "pattern")? {
            let leaf = &region[at..pattern_cutoff as usize];
            let bad = || DecompressionError::InvalidFormat(format!("bad pattern at offset {}", at));
            let (len, n) = decode_uvarint(leaf).ok_or_else(bad)?;
            if len > (leaf.len() - n) as u64 {
                return Err(bad());
            }
            let start = HEADER_SIZE + at + n;
            patterns.push((depth, PatternRef { start, len: len as usize }));
        }
        let dict = DecodeTables::build(&patterns, cfg.condense_pattern_table_bit_threshold)?;

        let pos_size = read_u64(data, dict_end, "position section size")?;
        let pos_root = read_u64(data, dict_end + 8, "position root")?;
        let pos_cutoff = read_u64(data, dict_end + 16, "position cutoff")?;
        let pos_start = dict_end + POS_HEADER_SIZE;
        let pos_end = section_end(pos_start, pos_size, data.len(), "position section")?;
        let region = &data[pos_start..pos_end];
        let mut positions = Vec::new();
        for (depth, at) in tree_leaves(region, pos_root, pos_cutoff, "position")? {
            let (pos, _) = decode_uvarint(&region[at..pos_cutoff as usize]).ok_or_else(|| {
                DecompressionError::InvalidFormat(format!("bad position at offset {}", at))
            })?;
            positions.push((depth, pos));
        }
        if words_count > 0 && positions.is_empty() {
            return Err(DecompressionError::InvalidFormat(format!(
                "{} words but no position codes",
                words_count
            )));
        }
        let pos_dict = DecodeTables::build(&positions, CONDENSE_PATTERN_TABLE_BIT_THRESHOLD)?;

        log::debug!(
            "opened {} words={} patterns={} pattern_depth={} positions={} position_depth={}",
            file_path.display(),
            words_count,
            dict.len,
            dict.max_depth,
            pos_dict.len,
            pos_dict.max_depth
        );
        Ok(Decompressor {
            file_path,
            mmap,
            words_count,
            dict,
            pos_dict,
            words_start: pos_end,
        })
    }

    /// Number of words in the file.
    pub fn count(&self) -> u64 {
        self.words_count
    }

    pub fn patterns_count(&self) -> usize {
        self.dict.len
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Size of the mapped file in bytes.
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Passes an access pattern hint for the mapping to the kernel.
    #[cfg(unix)]
    pub fn read_ahead(&self, advice: memmap2::Advice) -> Result<(), DecompressionError> {
        self.mmap.advise(advice)?;
        Ok(())
    }

    fn pattern(&self, p: PatternRef) -> &[u8] {
        &self.mmap[p.start..p.start + p.len]
    }

    pub fn make_getter(&self) -> Getter<'_> {
        Getter {
            d: self,
            data: &self.mmap[self.words_start..],
            data_p: 0,
            data_bit: 0,
            spans: Vec::new(),
            gaps: Vec::new(),
        }
    }

    /// Unmaps the file.
    pub fn close(self) -> Result<(), DecompressionError> {
        drop(self);
        Ok(())
    }
}

/// Cursor over the word stream. Offsets are relative to the first word;
/// a getter is meant for one thread, make one per reader.
pub struct Getter<'a> {
    d: &'a Decompressor,
    data: &'a [u8],
    data_p: usize,
    data_bit: usize,
    // patterns of the current word as (offset in word, pattern)
    spans: Vec<(usize, PatternRef)>,
    // stretches of the current word stored as literal bytes
    gaps: Vec<(usize, usize)>,
}

impl<'a> Getter<'a> {
    fn corrupt(&self, reason: impl Into<String>) -> DecompressionError {
        DecompressionError::Corrupt {
            offset: (self.d.words_start + self.data_p) as u64,
            reason: reason.into(),
        }
    }

    fn next_pos(&mut self, clean: bool) -> Result<u64, DecompressionError> {
        if clean && self.data_bit > 0 {
            self.data_p += 1;
            self.data_bit = 0;
        }
        self.d
            .pos_dict
            .decode(self.data, &mut self.data_p, &mut self.data_bit)
            .map_err(|reason| self.corrupt(format!("position code: {}", reason)))
    }

    fn next_pattern(&mut self) -> Result<PatternRef, DecompressionError> {
        self.d
            .dict
            .decode(self.data, &mut self.data_p, &mut self.data_bit)
            .map_err(|reason| self.corrupt(format!("pattern code: {}", reason)))
    }

    /// Decodes the codes of the word at the cursor into `spans` and `gaps`
    /// and leaves the cursor on its first literal byte. On error the cursor
    /// is back at the start of the word.
    fn read_layout(&mut self) -> Result<usize, DecompressionError> {
        let save = self.data_p;
        let res = self.read_layout_at_cursor();
        if res.is_err() {
            self.data_p = save;
            self.data_bit = 0;
        }
        res
    }

    fn read_layout_at_cursor(&mut self) -> Result<usize, DecompressionError> {
        self.spans.clear();
        self.gaps.clear();
        let word_len = self
            .next_pos(true)?
            .checked_sub(1)
            .ok_or_else(|| self.corrupt("word starts with a terminator"))? as usize;

        let mut uncovered = 0;
        if word_len > 0 {
            let mut buf_pos = 0usize;
            let mut last_uncovered = 0usize;
            loop {
                let pos = self.next_pos(false)?;
                if pos == 0 {
                    break;
                }
                let step = (pos - 1) as usize;
                let pattern = self.next_pattern()?;
                if step > word_len - buf_pos || pattern.len > word_len - buf_pos - step {
                    return Err(self.corrupt(format!(
                        "pattern at {} overruns word of {} bytes",
                        buf_pos.saturating_add(step),
                        word_len
                    )));
                }
                buf_pos += step;
                if buf_pos > last_uncovered {
                    self.gaps.push((last_uncovered, buf_pos));
                    uncovered += buf_pos - last_uncovered;
                }
                last_uncovered = buf_pos + pattern.len;
                self.spans.push((buf_pos, pattern));
            }
            if word_len > last_uncovered {
                self.gaps.push((last_uncovered, word_len));
                uncovered += word_len - last_uncovered;
            }
        }
        if self.data_bit > 0 {
            self.data_p += 1;
            self.data_bit = 0;
        }
        if uncovered > self.data.len().saturating_sub(self.data_p) {
            return Err(self.corrupt(format!(
                "{} literal bytes run past the end of data",
                uncovered
            )));
        }
        Ok(word_len)
    }

    /// Appends the word at the cursor to `buf` and moves to the next word.
    /// Returns the buffer and the offset of the next word.
    pub fn next(&mut self, mut buf: Vec<u8>) -> Result<(Vec<u8>, u64), DecompressionError> {
        let word_len = self.read_layout()?;
        let base = buf.len();
        buf.resize(base + word_len, 0);

        // patterns first, then the literals fill the gaps between them
        for &(pos, pattern) in &self.spans {
            buf[base + pos..base + pos + pattern.len].copy_from_slice(self.d.pattern(pattern));
        }
        let mut lit = self.data_p;
        for &(from, to) in &self.gaps {
            let n = to - from;
            buf[base + from..base + to].copy_from_slice(&self.data[lit..lit + n]);
            lit += n;
        }
        self.data_p = lit;
        Ok((buf, lit as u64))
    }

    /// Moves past the word at the cursor without copying it. Returns the
    /// offset of the next word and the length of the skipped one.
    pub fn skip(&mut self) -> Result<(u64, usize), DecompressionError> {
        let word_len = self.read_layout()?;
        let uncovered: usize = self.gaps.iter().map(|&(from, to)| to - from).sum();
        self.data_p += uncovered;
        Ok((self.data_p as u64, word_len))
    }

    /// Checks whether the word at the cursor equals `buf`. On a match the
    /// cursor moves to the next word, otherwise it stays put. Returns the
    /// resulting offset either way.
    pub fn match_word(&mut self, buf: &[u8]) -> Result<(bool, u64), DecompressionError> {
        let save = self.data_p;
        let word_len = self.read_layout()?;
        let mut matched = word_len == buf.len()
            && self
                .spans
                .iter()
                .all(|&(pos, p)| buf[pos..pos + p.len] == *self.d.pattern(p));
        let mut lit = self.data_p;
        if matched {
            for &(from, to) in &self.gaps {
                let n = to - from;
                if buf[from..to] != self.data[lit..lit + n] {
                    matched = false;
                    break;
                }
                lit += n;
            }
        }
        if !matched {
            self.data_p = save;
            self.data_bit = 0;
            return Ok((false, save as u64));
        }
        self.data_p = lit;
        Ok((true, lit as u64))
    }

    /// Whether the word at the cursor starts with `prefix`. Never moves the
    /// cursor.
    pub fn match_prefix(&mut self, prefix: &[u8]) -> Result<bool, DecompressionError> {
        let save = self.data_p;
        let res = self.prefix_matches(prefix);
        self.data_p = save;
        self.data_bit = 0;
        res
    }

    fn prefix_matches(&mut self, prefix: &[u8]) -> Result<bool, DecompressionError> {
        let word_len = self.read_layout()?;
        let plen = prefix.len();
        if word_len < plen {
            return Ok(false);
        }
        for &(pos, p) in &self.spans {
            if pos >= plen {
                break;
            }
            let n = p.len.min(plen - pos);
            if prefix[pos..pos + n] != self.d.pattern(p)[..n] {
                return Ok(false);
            }
        }
        let mut lit = self.data_p;
        for &(from, to) in &self.gaps {
            if from >= plen {
                break;
            }
            let n = to.min(plen) - from;
            if prefix[from..from + n] != self.data[lit..lit + n] {
                return Ok(false);
            }
            lit += to - from;
        }
        Ok(true)
    }

    /// Orders `buf` against the word at the cursor, moving past the word
    /// only when they are equal.
    pub fn match_cmp(&mut self, buf: &[u8]) -> Result<Ordering, DecompressionError> {
        let save = self.data_p;
        let (word, _) = self.next(Vec::with_capacity(buf.len()))?;
        let ord = buf.cmp(word.as_slice());
        if ord != Ordering::Equal {
            self.data_p = save;
            self.data_bit = 0;
        }
        Ok(ord)
    }

    /// Moves the cursor to `offset`, which must be the start of a word.
    pub fn reset(&mut self, offset: u64) {
        self.data_p = offset as usize;
        self.data_bit = 0;
    }

    pub fn has_next(&self) -> bool {
        self.data_p < self.data.len()
    }

    /// Current offset in the word stream.
    pub fn data_offset(&self) -> u64 {
        self.data_p as u64
    }

    /// Size of the word stream in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn file_name(&self) -> String {
        self.d.file_name()
    }
}
