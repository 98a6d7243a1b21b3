#![no_main]

use erigon_compress::compress::{Cfg, Compressor};
use erigon_compress::decompress::Decompressor;
use libfuzzer_sys::fuzz_target;
use tempfile::TempDir;

// data[0] picks the worker count, data[1] the number of length bytes that
// follow; the rest is cut into words of those lengths.
fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let workers = (data[0] % 4) as usize + 1;
    let lens_count = (data[1] as usize % 100).max(1);
    if data.len() < 2 + lens_count {
        return;
    }
    let lens = &data[2..2 + lens_count];
    let x = &data[2 + lens_count..];

    let mut words = Vec::new();
    let mut j = 0;
    for &l in lens {
        let next = (j + l as usize).min(x.len());
        // odd lengths are stored verbatim
        words.push((x[j..next].to_vec(), l % 2 == 0));
        j = next;
    }

    let Ok(tmp_dir) = TempDir::new() else {
        return;
    };
    let file_path = tmp_dir.path().join("fuzz.seg");
    let cfg = Cfg {
        min_pattern_score: 2,
        min_pattern_len: 3,
        workers,
        ..Default::default()
    };
    let mut c = Compressor::new(cfg, &file_path, tmp_dir.path(), "fuzz", log::Level::Debug)
        .expect("compressor");
    c.disable_fsync();
    for (word, compress) in &words {
        if *compress {
            c.add_word(word).expect("add_word");
        } else {
            c.add_uncompressed_word(word).expect("add_uncompressed_word");
        }
    }
    c.compress().expect("compress");
    c.close().expect("close");

    let d = Decompressor::open(&file_path).expect("open");
    let mut g = d.make_getter();
    for (i, (expected, _)) in words.iter().enumerate() {
        assert!(g.has_next(), "word {} missing", i);
        let (word, _) = g.next(Vec::new()).expect("next");
        assert_eq!(&word, expected, "word {}", i);
    }
    assert!(!g.has_next());
});
