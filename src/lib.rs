pub mod compress;
pub mod decompress;
pub mod dictionary_builder;
pub mod error;
pub mod etl;
pub mod huffman;
pub mod parallel_compress;
pub mod patricia;
pub mod superstring;

// Re-export main types
pub use compress::{Cfg, Compressor, RawWordsFile};
pub use decompress::{Decompressor, DecompressorCfg, Getter};
pub use dictionary_builder::DictionaryBuilder;
pub use error::{CompressionError, DecompressionError};
pub use patricia::{MatchFinder, PatriciaTree};
