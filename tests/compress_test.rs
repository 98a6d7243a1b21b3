use erigon_compress::compress::{decode_uvarint, Cfg, Compressor};
use erigon_compress::decompress::Decompressor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compress_words(dir: &Path, name: &str, cfg: Cfg, words: &[(Vec<u8>, bool)]) -> PathBuf {
    let file_path = dir.join(name);
    let mut compressor =
        Compressor::new(cfg, &file_path, dir.join("tmp"), "test", log::Level::Debug).unwrap();
    compressor.disable_fsync();
    for (word, compress) in words {
        if *compress {
            compressor.add_word(word).unwrap();
        } else {
            compressor.add_uncompressed_word(word).unwrap();
        }
    }
    compressor.compress().unwrap();
    compressor.close().unwrap();
    file_path
}

fn read_all(path: &Path) -> Vec<Vec<u8>> {
    let d = Decompressor::open(path).unwrap();
    let mut g = d.make_getter();
    let mut out = Vec::new();
    while g.has_next() {
        let (word, _) = g.next(Vec::new()).unwrap();
        out.push(word);
    }
    assert_eq!(out.len() as u64, d.count());
    out
}

fn low_score_cfg(workers: usize) -> Cfg {
    Cfg {
        min_pattern_score: 1,
        workers,
        ..Default::default()
    }
}

fn prepare_dict() -> Vec<(Vec<u8>, bool)> {
    let mut words = Vec::new();
    for i in 0..100 {
        words.push((Vec::new(), true));
        words.push((b"long".to_vec(), true));
        words.push((b"word".to_vec(), true));
        words.push((format!("{} longlongword {}", i, i).into_bytes(), true));
    }
    words
}

#[test]
fn test_compress_empty() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = compress_words(dir.path(), "empty.seg", Cfg::default(), &[]);

    let d = Decompressor::open(&path).unwrap();
    assert_eq!(d.count(), 0);
    assert_eq!(d.patterns_count(), 0);
    // header plus the empty position section header
    assert_eq!(d.size(), 56);
    assert!(!d.make_getter().has_next());
}

#[test]
fn test_compress_single_novel_word() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let words = vec![(b"word".to_vec(), true)];
    let path = compress_words(dir.path(), "single.seg", Cfg::default(), &words);
    assert_eq!(read_all(&path), vec![b"word".to_vec()]);
}

#[test]
fn test_compress_dict1() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let words = prepare_dict();
    let path = compress_words(dir.path(), "dict1.seg", low_score_cfg(2), &words);

    let d = Decompressor::open(&path).unwrap();
    assert!(d.patterns_count() > 0);
    let mut g = d.make_getter();
    for (i, (expected, _)) in words.iter().enumerate() {
        assert!(g.has_next());
        let (word, _) = g.next(Vec::new()).unwrap();
        assert_eq!(&word, expected, "word {}", i);
    }
    assert!(!g.has_next());
}

#[test]
fn test_repeated_literal_shrinks() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let words: Vec<(Vec<u8>, bool)> = (0..100).map(|_| (b"longlongword".to_vec(), true)).collect();
    let raw: u64 = words.iter().map(|(w, _)| w.len() as u64).sum();
    let path = compress_words(dir.path(), "repeated.seg", low_score_cfg(1), &words);

    let d = Decompressor::open(&path).unwrap();
    assert!(d.patterns_count() > 0);
    assert!(d.size() < raw, "compressed {} raw {}", d.size(), raw);
    drop(d);
    let got = read_all(&path);
    assert_eq!(got.len(), 100);
    assert!(got.iter().all(|w| w == b"longlongword"));
}

// Walks the leaf records of the serialized pattern section.
fn serialized_patterns(path: &Path) -> Vec<Vec<u8>> {
    let data = std::fs::read(path).unwrap();
    let be = |at: usize| u64::from_be_bytes(data[at..at + 8].try_into().unwrap()) as usize;
    let (size, cutoff) = (be(8), be(24));
    assert!(cutoff <= size);
    let leaves = &data[32..32 + cutoff];
    let mut patterns = Vec::new();
    let mut at = 0;
    while at < leaves.len() {
        let (len, n) = decode_uvarint(&leaves[at..]).unwrap();
        at += n;
        patterns.push(leaves[at..at + len as usize].to_vec());
        at += len as usize;
    }
    patterns
}

#[test]
fn test_repeated_literal_stored_once() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut words = Vec::new();
    for i in 0..300 {
        words.push((b"0123456789".to_vec(), true));
        words.push((format!("n{}", i).into_bytes(), true));
    }
    let raw: u64 = words.iter().map(|(w, _)| w.len() as u64).sum();
    let path = compress_words(dir.path(), "literal.seg", Cfg::default(), &words);

    assert_eq!(serialized_patterns(&path), vec![b"0123456789".to_vec()]);
    let d = Decompressor::open(&path).unwrap();
    assert_eq!(d.patterns_count(), 1);
    assert!(d.size() < raw, "compressed {} raw {}", d.size(), raw);
    drop(d);
    let expected: Vec<Vec<u8>> = words.into_iter().map(|(w, _)| w).collect();
    assert_eq!(read_all(&path), expected);
}

#[test]
fn test_uncompressed_and_empty_words() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut words = Vec::new();
    for i in 0..50 {
        words.push((format!("compressible-pattern-{}", i % 5).into_bytes(), true));
        words.push((format!("compressible-pattern-{}", i % 5).into_bytes(), false));
        words.push((Vec::new(), i % 2 == 0));
    }
    let path = compress_words(dir.path(), "mixed.seg", low_score_cfg(1), &words);
    let expected: Vec<Vec<u8>> = words.into_iter().map(|(w, _)| w).collect();
    assert_eq!(read_all(&path), expected);
}

#[test]
fn test_parallel_output_matches_sequential() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let stems = ["account", "storage", "receipt", "transaction", "header"];
    let words: Vec<(Vec<u8>, bool)> = (0..20_000)
        .map(|i| {
            let stem = stems[rng.gen_range(0..stems.len())];
            let w = format!("{}-{}-{}", stem, rng.gen_range(0..100), i).into_bytes();
            (w, i % 97 != 0)
        })
        .collect();

    let seq = compress_words(dir.path(), "seq.seg", low_score_cfg(1), &words);
    let par = compress_words(dir.path(), "par.seg", low_score_cfg(4), &words);

    let expected: Vec<Vec<u8>> = words.iter().map(|(w, _)| w.clone()).collect();
    assert_eq!(read_all(&par), expected);
    assert_eq!(
        std::fs::read(&seq).unwrap(),
        std::fs::read(&par).unwrap(),
        "worker count must not change the output"
    );
}

#[test]
fn test_compress_deterministic() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let words = prepare_dict();
    let a = compress_words(dir.path(), "a.seg", low_score_cfg(2), &words);
    let b = compress_words(dir.path(), "b.seg", low_score_cfg(2), &words);
    assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
}

#[test]
fn test_large_random_words() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let words: Vec<(Vec<u8>, bool)> = (0..200)
        .map(|_| {
            let len = rng.gen_range(0..5000);
            ((0..len).map(|_| rng.gen::<u8>()).collect(), true)
        })
        .collect();
    let path = compress_words(dir.path(), "random.seg", low_score_cfg(2), &words);
    let expected: Vec<Vec<u8>> = words.into_iter().map(|(w, _)| w).collect();
    assert_eq!(read_all(&path), expected);
}

#[test]
fn test_tmp_output_replaced() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = compress_words(dir.path(), "final.seg", Cfg::default(), &[(b"x".to_vec(), true)]);
    assert!(path.exists());
    assert!(!dir.path().join("final.seg.tmp").exists());
}
