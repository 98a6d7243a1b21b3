use erigon_compress::compress::{Cfg, Compressor};
use erigon_compress::decompress::Decompressor;
use proptest::prelude::*;
use std::path::Path;
use tempfile::TempDir;

// Small alphabet so that words share substrings and patterns get picked.
fn word_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(prop::sample::select(b"abcde".to_vec()), 0..64),
        prop::collection::vec(any::<u8>(), 0..32),
    ]
}

fn words_strategy() -> impl Strategy<Value = Vec<(Vec<u8>, bool)>> {
    prop::collection::vec((word_strategy(), prop::bool::weighted(0.9)), 0..200)
}

fn compress(dir: &Path, words: &[(Vec<u8>, bool)], workers: usize) -> Decompressor {
    let _ = env_logger::builder().is_test(true).try_init();
    let file_path = dir.join("fuzz.seg");
    let cfg = Cfg {
        min_pattern_score: 2,
        min_pattern_len: 3,
        workers,
        ..Default::default()
    };
    let mut compressor =
        Compressor::new(cfg, &file_path, dir, "proptest", log::Level::Debug).unwrap();
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
    Decompressor::open(&file_path).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_compress_decompress_roundtrip(words in words_strategy(), workers in 1usize..4) {
        let dir = TempDir::new().unwrap();
        let d = compress(dir.path(), &words, workers);
        prop_assert_eq!(d.count(), words.len() as u64);

        let mut g = d.make_getter();
        for (expected, _) in &words {
            prop_assert!(g.has_next());
            let (word, _) = g.next(Vec::new()).unwrap();
            prop_assert_eq!(&word, expected);
        }
        prop_assert!(!g.has_next());
    }

    #[test]
    fn test_skip_and_match_agree_with_next(words in words_strategy()) {
        let dir = TempDir::new().unwrap();
        let d = compress(dir.path(), &words, 1);
        let mut reader = d.make_getter();
        let mut skipper = d.make_getter();
        let mut matcher = d.make_getter();

        for (expected, _) in &words {
            let (_, next_offset) = reader.next(Vec::new()).unwrap();

            let (skip_offset, len) = skipper.skip().unwrap();
            prop_assert_eq!(skip_offset, next_offset);
            prop_assert_eq!(len, expected.len());

            for cut in [0, expected.len() / 3, expected.len()] {
                prop_assert!(matcher.match_prefix(&expected[..cut]).unwrap());
            }
            let (ok, match_offset) = matcher.match_word(expected).unwrap();
            prop_assert!(ok);
            prop_assert_eq!(match_offset, next_offset);
        }
    }
}

#[test]
fn test_single_byte_words() {
    let dir = TempDir::new().unwrap();
    let words: Vec<(Vec<u8>, bool)> = (0..=255u8).map(|b| (vec![b], true)).collect();
    let d = compress(dir.path(), &words, 2);
    let mut g = d.make_getter();
    for (expected, _) in &words {
        assert_eq!(&g.next(Vec::new()).unwrap().0, expected);
    }
    assert!(!g.has_next());
}

#[test]
fn test_repeated_words() {
    let dir = TempDir::new().unwrap();
    let word = b"repeated-word-with-some-length".to_vec();
    let words: Vec<(Vec<u8>, bool)> = (0..1000).map(|_| (word.clone(), true)).collect();
    let d = compress(dir.path(), &words, 2);
    assert!(d.patterns_count() > 0);
    assert!(d.size() < (word.len() * 1000) as u64);
    let mut g = d.make_getter();
    let mut n = 0;
    while g.has_next() {
        let (ok, _) = g.match_word(&word).unwrap();
        assert!(ok);
        n += 1;
    }
    assert_eq!(n, 1000);
}
