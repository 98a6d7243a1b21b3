#![no_main]

use erigon_compress::decompress::Decompressor;
use libfuzzer_sys::fuzz_target;
use tempfile::TempDir;

// Arbitrary bytes as a segment file: opening and reading may fail but must
// never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(tmp_dir) = TempDir::new() else {
        return;
    };
    let path = tmp_dir.path().join("input.seg");
    if std::fs::write(&path, data).is_err() {
        return;
    }
    let Ok(d) = Decompressor::open(&path) else {
        return;
    };
    let mut g = d.make_getter();
    let mut words = 0;
    while g.has_next() && words < 10_000 {
        let before = g.data_offset();
        let _ = g.match_prefix(b"ab");
        assert_eq!(g.data_offset(), before);
        if g.next(Vec::new()).is_err() || g.data_offset() == before {
            break;
        }
        words += 1;
    }
});
