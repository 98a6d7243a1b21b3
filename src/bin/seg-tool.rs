use clap::{Parser, Subcommand};
use erigon_compress::compress::{ratio_to_string, Cfg, Compressor};
use erigon_compress::decompress::Decompressor;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "seg-tool", about = "Build and inspect compressed segment files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress a file holding one word per line
    Compress {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[arg(long, default_value_t = 1024)]
        min_pattern_score: u64,
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
        /// Lines are hex encoded words
        #[arg(long)]
        hex: bool,
        /// Store every word verbatim
        #[arg(long)]
        uncompressed: bool,
    },
    /// Print the words of a segment file
    Dump {
        file: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        hex: bool,
    },
    /// Print header statistics of a segment file
    Stats { file: PathBuf },
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:5} {}",
                chrono::Local::now().format("%m-%d|%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

#[allow(clippy::too_many_arguments)]
fn compress(
    input: PathBuf,
    output: PathBuf,
    workers: usize,
    min_pattern_score: u64,
    tmp_dir: Option<PathBuf>,
    hex: bool,
    uncompressed: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Cfg {
        workers,
        min_pattern_score,
        ..Default::default()
    };
    let tmp_dir = tmp_dir.unwrap_or_else(std::env::temp_dir);
    let mut c = Compressor::new(cfg, &output, tmp_dir, "seg-tool", log::Level::Info)?;
    for line in BufReader::new(File::open(&input)?).lines() {
        let line = line?;
        let word = if hex {
            hex::decode(line.trim())?
        } else {
            line.into_bytes()
        };
        if uncompressed {
            c.add_uncompressed_word(&word)?;
        } else {
            c.add_word(&word)?;
        }
    }
    let count = c.count();
    c.compress()?;
    log::info!(
        "compressed {} words into {} ratio={}",
        count,
        output.display(),
        ratio_to_string(c.ratio())
    );
    c.close()?;
    Ok(())
}

fn dump(file: PathBuf, limit: Option<usize>, hex: bool) -> Result<(), Box<dyn std::error::Error>> {
    let d = Decompressor::open(&file)?;
    let mut g = d.make_getter();
    let mut out = BufWriter::new(std::io::stdout().lock());
    let mut buf = Vec::new();
    let mut n = 0;
    while g.has_next() && limit.map_or(true, |l| n < l) {
        buf.clear();
        buf = g.next(buf)?.0;
        if hex {
            writeln!(out, "{}", hex::encode(&buf))?;
        } else {
            out.write_all(&buf)?;
            out.write_all(b"\n")?;
        }
        n += 1;
    }
    out.flush()?;
    Ok(())
}

fn stats(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let d = Decompressor::open(&file)?;
    let mut g = d.make_getter();
    let (mut raw, mut empty) = (0u64, 0u64);
    while g.has_next() {
        let (_, len) = g.skip()?;
        raw += len as u64;
        if len == 0 {
            empty += 1;
        }
    }
    println!("file:       {}", d.file_name());
    println!("size:       {}", d.size());
    println!("words:      {}", d.count());
    println!("empty:      {}", empty);
    println!("patterns:   {}", d.patterns_count());
    println!("raw bytes:  {}", raw);
    if d.size() > 0 {
        println!("ratio:      {}", ratio_to_string(raw as f64 / d.size() as f64));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    match Cli::parse().command {
        Command::Compress {
            input,
            output,
            workers,
            min_pattern_score,
            tmp_dir,
            hex,
            uncompressed,
        } => compress(
            input,
            output,
            workers,
            min_pattern_score,
            tmp_dir,
            hex,
            uncompressed,
        ),
        Command::Dump { file, limit, hex } => dump(file, limit, hex),
        Command::Stats { file } => stats(file),
    }
}
