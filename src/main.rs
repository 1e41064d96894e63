use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use binscan::format::block::encode_block;
use binscan::{export_json, render_tree, scan, CodecId, FormatSet, InputRange, LogSink, NodeKey, ScanConfig};

#[derive(Parser)]
#[command(name = "binscan", about = "Map embedded formats and nested streams inside binary files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a file and print what was found where
    Scan {
        input: PathBuf,
        /// JSON config file (see ScanConfig)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Worker threads (default: available parallelism)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Read-ahead page size in bytes
        #[arg(long)]
        page_size: Option<usize>,
        /// Print the result tree as JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// Wrap a file in a BLCK container
    Wrap {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Codec: zstd (default), lz4, brotli, lzma, rle, none
        #[arg(short, long, default_value = "zstd")]
        codec: String,
        /// Compression level (zstd 1-19; brotli 0-11; ignored otherwise)
        #[arg(short, long, default_value = "3")]
        level: i32,
    },
    /// Scan a file, then resolve a hex node key against the result
    Resolve {
        input: PathBuf,
        key:   String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("binscan=info")))
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input, config, workers, page_size, json } => {
            let mut cfg = match config {
                Some(path) => ScanConfig::load(path)?,
                None       => ScanConfig::default(),
            };
            if let Some(w) = workers   { cfg.workers = w; }
            if let Some(p) = page_size { cfg.page_size = p; }

            let handle = scan(InputRange::open_file(&input)?, Arc::new(FormatSet::builtin()), Arc::new(LogSink), cfg)?;
            handle.wait();

            let stdout = io::stdout();
            let mut out = stdout.lock();
            if json {
                export_json(handle.tree(), &mut out)?;
                writeln!(out)?;
            } else {
                render_tree(handle.tree(), &mut out)?;
            }
        }

        // ── Wrap ─────────────────────────────────────────────────────────────
        Commands::Wrap { input, output, codec, level } => {
            let codec_id = parse_codec(&codec);
            let data  = std::fs::read(&input)?;
            let block = encode_block(0, 0, &data, codec_id, level)?;
            std::fs::write(&output, &block)?;
            println!(
                "Wrapped {} ({} B) → {} ({} B, {})",
                input.display(), data.len(), output.display(), block.len(), codec_id.name(),
            );
        }

        // ── Resolve ──────────────────────────────────────────────────────────
        Commands::Resolve { input, key } => {
            let key    = NodeKey::from_hex(&key)?;
            let handle = scan(InputRange::open_file(&input)?, Arc::new(FormatSet::builtin()), Arc::new(LogSink), ScanConfig::default())?;
            handle.wait();
            match handle.resolve_path(&key) {
                Some(chain) => {
                    for (depth, node) in chain.iter().enumerate() {
                        println!("{:indent$}{:#010x}..{:#010x}  {}", "", node.start, node.end, node.name, indent = depth * 2);
                    }
                }
                None => {
                    eprintln!("Key {key} does not resolve");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{}', defaulting to zstd", s);
        CodecId::Zstd
    })
}
