use erigon_compress::compress::{Cfg, Compressor};
use erigon_compress::decompress::{Decompressor, DecompressorCfg};
use erigon_compress::error::DecompressionError;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LOREM: &str = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod tempor incididunt ut labore et \
dolore magna aliqua ut enim ad minim veniam quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo \
consequat duis aute irure dolor in reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla pariatur \
excepteur sint occaecat cupidatat non proident sunt in culpa qui officia deserunt mollit anim id est laborum";

fn lorem_words() -> Vec<String> {
    let mut words: Vec<String> = LOREM.split(' ').map(|s| s.to_string()).collect();
    // empty string for the corner case
    words.push(String::new());
    words.iter().enumerate().map(|(k, w)| format!("{} {}", w, k)).collect()
}

fn compress(dir: &Path, name: &str, words: &[Vec<u8>]) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let file_path = dir.join(name);
    let cfg = Cfg {
        min_pattern_score: 1,
        workers: 2,
        ..Default::default()
    };
    let mut compressor =
        Compressor::new(cfg, &file_path, dir, "test", log::Level::Debug).unwrap();
    compressor.disable_fsync();
    for w in words {
        compressor.add_word(w).unwrap();
    }
    compressor.compress().unwrap();
    compressor.close().unwrap();
    file_path
}

fn prepare_lorem_dict() -> (TempDir, Decompressor) {
    let dir = TempDir::new().unwrap();
    let words: Vec<Vec<u8>> = lorem_words().into_iter().map(String::into_bytes).collect();
    let path = compress(dir.path(), "lorem.seg", &words);
    let d = Decompressor::open(&path).unwrap();
    (dir, d)
}

fn prepare_stupid_dict(size: usize) -> (TempDir, Decompressor) {
    let dir = TempDir::new().unwrap();
    let words: Vec<Vec<u8>> = (0..size).map(|i| format!("word-{}", i).into_bytes()).collect();
    let path = compress(dir.path(), "stupid.seg", &words);
    let d = Decompressor::open(&path).unwrap();
    (dir, d)
}

#[test]
fn test_decompress_next() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    assert_eq!(d.count(), expected.len() as u64);
    assert!(d.patterns_count() > 0);

    let mut g = d.make_getter();
    for w in &expected {
        assert!(g.has_next());
        let (word, offset) = g.next(Vec::new()).unwrap();
        assert_eq!(String::from_utf8_lossy(&word), *w);
        assert_eq!(offset, g.data_offset());
    }
    assert!(!g.has_next());
    assert_eq!(g.data_offset() as usize, g.size());
}

#[test]
fn test_next_appends_to_buffer() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    let mut buf = Vec::new();
    while g.has_next() {
        buf = g.next(buf).unwrap().0;
    }
    assert_eq!(buf, expected.concat().into_bytes());
}

#[test]
fn test_decompress_skip() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    let mut i = 0;
    while g.has_next() {
        if i % 2 == 0 {
            let (_, len) = g.skip().unwrap();
            assert_eq!(len, expected[i].len());
        } else {
            let (word, _) = g.next(Vec::new()).unwrap();
            assert_eq!(String::from_utf8_lossy(&word), expected[i]);
        }
        i += 1;
    }
    assert_eq!(i, expected.len());

    g.reset(0);
    let (_, offset) = g.next(Vec::new()).unwrap();
    assert!(offset > 0);
    let (_, offset2) = g.next(Vec::new()).unwrap();
    assert!(offset2 > offset);
}

#[test]
fn test_skip_offsets_match_next() {
    let (_dir, d) = prepare_lorem_dict();
    let mut a = d.make_getter();
    let mut b = d.make_getter();
    while a.has_next() {
        let (_, off_a) = a.next(Vec::new()).unwrap();
        let (off_b, _) = b.skip().unwrap();
        assert_eq!(off_a, off_b);
    }
    assert!(!b.has_next());
}

#[test]
fn test_decompress_match_ok() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    for (i, w) in expected.iter().enumerate() {
        if i % 2 != 0 {
            let before = g.data_offset();
            let (ok, offset) = g.match_word(w.as_bytes()).unwrap();
            assert!(ok, "expected match with {}", w);
            assert!(offset > before);
            assert_eq!(offset, g.data_offset());
        } else {
            let (word, _) = g.next(Vec::new()).unwrap();
            assert_eq!(String::from_utf8_lossy(&word), *w);
        }
    }
    assert!(!g.has_next());
}

#[test]
fn test_decompress_match_not_ok() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    for (i, w) in expected.iter().enumerate() {
        let before = g.data_offset();
        let wrong = format!("{} {}", w, i + 1);
        let (ok, offset) = g.match_word(wrong.as_bytes()).unwrap();
        assert!(!ok, "not expected match with {}", wrong);
        assert_eq!(offset, before);
        assert_eq!(g.data_offset(), before);
        g.skip().unwrap();
    }
}

#[test]
fn test_match_same_length_mismatch() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    for w in &expected {
        if !w.is_empty() {
            let mut wrong = w.clone().into_bytes();
            let last = wrong.len() - 1;
            wrong[last] ^= 0x20;
            let (ok, _) = g.match_word(&wrong).unwrap();
            assert!(!ok);
        }
        let (ok, _) = g.match_word(w.as_bytes()).unwrap();
        assert!(ok);
    }
}

#[test]
fn test_decompress_match_prefix() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    for w in &expected {
        let before = g.data_offset();
        let half = &w.as_bytes()[..w.len() / 2];
        assert!(g.match_prefix(half).unwrap(), "expected match with prefix of {}", w);
        assert!(g.match_prefix(w.as_bytes()).unwrap());
        assert!(g.match_prefix(b"").unwrap());
        assert_eq!(g.data_offset(), before);
        g.skip().unwrap();
    }

    g.reset(0);
    for w in &expected {
        let mut wrong = w.as_bytes()[..w.len() / 2].to_vec();
        if let Some(last) = wrong.last_mut() {
            *last = last.wrapping_add(1);
            assert!(!g.match_prefix(&wrong).unwrap());
        }
        // longer than the word itself
        let longer = format!("{}x", w);
        assert!(!g.match_prefix(longer.as_bytes()).unwrap());
        g.skip().unwrap();
    }
}

#[test]
fn test_match_cmp() {
    let (_dir, d) = prepare_lorem_dict();
    let expected = lorem_words();
    let mut g = d.make_getter();
    for w in &expected {
        let before = g.data_offset();
        let bigger = format!("{}~", w);
        assert_eq!(g.match_cmp(bigger.as_bytes()).unwrap(), Ordering::Greater);
        assert_eq!(g.data_offset(), before);
        if !w.is_empty() {
            let smaller = &w.as_bytes()[..w.len() - 1];
            assert_eq!(g.match_cmp(smaller).unwrap(), Ordering::Less);
            assert_eq!(g.data_offset(), before);
        }
        assert_eq!(g.match_cmp(w.as_bytes()).unwrap(), Ordering::Equal);
        assert!(g.data_offset() > before);
    }
}

#[test]
fn test_decompress_torrent_like_words() {
    let (_dir, d) = prepare_stupid_dict(10_000);
    let mut g = d.make_getter();
    let mut i = 0;
    while g.has_next() {
        let expected = format!("word-{}", i);
        let (ok, _) = g.match_word(expected.as_bytes()).unwrap();
        assert!(ok, "word {}", i);
        i += 1;
    }
    assert_eq!(i, 10_000);
}

#[test]
fn test_reset_to_saved_offsets() {
    let (_dir, d) = prepare_stupid_dict(1_000);
    let mut g = d.make_getter();
    let mut offsets = vec![0u64];
    while g.has_next() {
        let (next, _) = g.skip().unwrap();
        offsets.push(next);
    }
    for i in (0..1_000).rev().step_by(37) {
        g.reset(offsets[i]);
        let (word, next) = g.next(Vec::new()).unwrap();
        assert_eq!(word, format!("word-{}", i).into_bytes());
        assert_eq!(next, offsets[i + 1]);
    }
}

#[test]
fn test_condensed_tables_decode_the_same() {
    let (dir, d) = prepare_stupid_dict(5_000);
    let path = d.file_path().to_path_buf();
    let reference = {
        let mut g = d.make_getter();
        let mut words = Vec::new();
        while g.has_next() {
            words.push(g.next(Vec::new()).unwrap().0);
        }
        words
    };
    for threshold in [4, 1, 0] {
        let cfg = DecompressorCfg {
            condense_pattern_table_bit_threshold: threshold,
        };
        let d = Decompressor::open_with_cfg(&path, cfg).unwrap();
        let mut g = d.make_getter();
        for w in &reference {
            assert_eq!(&g.next(Vec::new()).unwrap().0, w, "threshold {}", threshold);
        }
        assert!(!g.has_next());
    }
    drop(dir);
}

#[test]
fn test_reopen_is_idempotent() {
    let (_dir, d) = prepare_lorem_dict();
    let path = d.file_path().to_path_buf();
    let size = d.size();
    let count = d.count();
    d.close().unwrap();

    for _ in 0..3 {
        let d = Decompressor::open(&path).unwrap();
        assert_eq!(d.size(), size);
        assert_eq!(d.count(), count);
        assert_eq!(d.file_name(), "lorem.seg");
        let mut g = d.make_getter();
        let mut n = 0;
        while g.has_next() {
            g.skip().unwrap();
            n += 1;
        }
        assert_eq!(n, count);
    }
}

#[test]
fn test_getters_share_decompressor_across_threads() {
    let (_dir, d) = prepare_stupid_dict(2_000);
    std::thread::scope(|s| {
        for t in 0..4 {
            let d = &d;
            s.spawn(move || {
                let mut g = d.make_getter();
                let mut i = 0;
                while g.has_next() {
                    if (i + t) % 3 == 0 {
                        g.skip().unwrap();
                    } else {
                        let (word, _) = g.next(Vec::new()).unwrap();
                        assert_eq!(word, format!("word-{}", i).into_bytes());
                    }
                    i += 1;
                }
                assert_eq!(i, 2_000);
            });
        }
    });
}

#[test]
fn test_truncated_file_is_corrupt() {
    let dir = TempDir::new().unwrap();
    // no pattern can cover a single novel word, so its bytes sit at the end
    let word: Vec<u8> = (0..100u8).collect();
    let path = compress(dir.path(), "whole.seg", &[word.clone()]);
    let mut data = std::fs::read(&path).unwrap();
    data.truncate(data.len() - 10);
    let cut = dir.path().join("cut.seg");
    std::fs::write(&cut, &data).unwrap();

    let d = Decompressor::open(&cut).unwrap();
    let mut g = d.make_getter();
    assert!(matches!(
        g.next(Vec::new()),
        Err(DecompressionError::Corrupt { .. })
    ));
    assert_eq!(g.data_offset(), 0);
    assert!(g.skip().is_err());
    assert!(g.match_word(&word).is_err());
    assert!(g.match_prefix(&word[..10]).is_err());
    assert_eq!(g.data_offset(), 0);
}

#[test]
fn test_empty_words() {
    let dir = TempDir::new().unwrap();
    let words = vec![Vec::new(), b"between".to_vec(), Vec::new(), Vec::new()];
    let path = compress(dir.path(), "empties.seg", &words);
    let d = Decompressor::open(&path).unwrap();
    let mut g = d.make_getter();

    let (ok, _) = g.match_word(b"").unwrap();
    assert!(ok);
    assert!(!g.match_prefix(b"x").unwrap());
    assert!(g.match_prefix(b"").unwrap());
    assert_eq!(g.next(Vec::new()).unwrap().0, b"between");
    let (_, len) = g.skip().unwrap();
    assert_eq!(len, 0);
    let (word, _) = g.next(b"keep".to_vec()).unwrap();
    assert_eq!(word, b"keep");
    assert!(!g.has_next());
}
