//! Falx CLI binary: inspect and verify index manifests.

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::LevelFilter;

use falx::error::Result;
use falx::index::{
    generation_from_segments_file_name, CodecRegistry, FinderConfig, ManifestCodec, SegmentSet,
    SEGMENTS, SEGMENTS_GEN,
};
use falx::storage::{FileStorage, FileStorageConfig, Storage};

/// Falx - segment manifest inspection tools
#[derive(Parser, Debug)]
#[command(name = "falx")]
#[command(about = "Inspect and verify search index segment manifests")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct FalxArgs {
    /// Verbosity level (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current committed segment set of an index directory
    Inspect {
        /// Path to the index directory
        dir: PathBuf,
    },

    /// Check every manifest generation in a directory for validity
    Verify {
        /// Path to the index directory
        dir: PathBuf,
    },
}

fn main() {
    let args = FalxArgs::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();

    let result = match args.command {
        Command::Inspect { dir } => inspect(&dir),
        Command::Verify { dir } => verify(&dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn open_dir(path: &PathBuf) -> Result<Arc<dyn Storage>> {
    let storage = FileStorage::new(path, FileStorageConfig::default())?;
    Ok(Arc::new(storage))
}

fn inspect(path: &PathBuf) -> Result<()> {
    let dir = open_dir(path)?;
    let registry = CodecRegistry::with_defaults();
    let codec = ManifestCodec::new(&registry);

    let set = codec.read_latest(&dir, FinderConfig::default())?;

    println!(
        "{}: generation {}, version {}, {} segment(s), {} doc(s)",
        set.segments_file_name().unwrap_or_else(|| "?".to_string()),
        set.last_generation(),
        set.version(),
        set.len(),
        set.total_doc_count(),
    );
    for descriptor in set.iter() {
        println!(
            "  {}  codec={} docs={} del_gen={} del_count={}{}",
            descriptor.name(),
            descriptor.codec_name(),
            descriptor.doc_count(),
            descriptor.del_gen(),
            descriptor.del_count(),
            if descriptor.is_legacy() { "  [legacy]" } else { "" },
        );
    }
    if !set.user_data().is_empty() {
        println!("  user data: {:?}", set.user_data());
    }
    Ok(())
}

fn verify(path: &PathBuf) -> Result<()> {
    let dir = open_dir(path)?;
    let registry = CodecRegistry::with_defaults();
    let codec = ManifestCodec::new(&registry);

    let mut manifests: Vec<(i64, String)> = Vec::new();
    for file in dir.list_files()? {
        if file.starts_with(SEGMENTS) && file != SEGMENTS_GEN {
            if let Ok(gen) = generation_from_segments_file_name(&file) {
                manifests.push((gen, file));
            }
        }
    }
    manifests.sort();

    if manifests.is_empty() {
        println!("no manifest files found");
        return Ok(());
    }

    let mut bad = 0;
    for (gen, file) in &manifests {
        let mut set = SegmentSet::new();
        match codec.read(&mut set, &dir, file) {
            Ok(()) => println!("{file}: OK (generation {gen}, {} segment(s))", set.len()),
            Err(e) => {
                bad += 1;
                println!("{file}: INVALID ({e})");
            }
        }
    }

    if bad > 0 {
        println!("{bad} of {} manifest(s) failed verification", manifests.len());
    }
    Ok(())
}
