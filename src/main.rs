use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};

use ratarkit::index::{locate_candidates, default_index_folders, IndexCandidate, SQLiteIndex};
use ratarkit::mount::{MountSource, SQLiteIndexMountSource};
use ratarkit::tarindex::{TarIndexOptions, TarIndexer};

#[derive(Parser)]
#[command(name = "ratarkit", version = "0.1.0", about = "Seekable TAR and compressed-stream indexing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Force (re)build the index for an archive
    Build {
        archive: PathBuf,
        #[arg(short, long)]
        index_file: Option<PathBuf>,
        #[arg(short = 'r', long)]
        recursive: bool,
    },
    /// List a directory inside the indexed archive
    List {
        archive: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show one file's metadata
    Stat {
        archive: PathBuf,
        path: String,
        /// File version to look up: 0/negative counts back from the
        /// latest, positive counts forward from the first.
        #[arg(short, long, default_value_t = 0)]
        version: i64,
    },
    /// Print a file's contents to stdout
    Cat {
        archive: PathBuf,
        path: String,
        #[arg(short, long, default_value_t = 0)]
        version: i64,
    },
    /// Round-trip every member and report mismatches
    Verify { archive: PathBuf },
    /// Show index location, schema version, and row counts
    Info { archive: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Build { archive, index_file, recursive } => {
            let (_index, rows) = build_index(&archive, index_file, recursive)?;
            println!("Indexed {} entries from {}", rows, archive.display());
        }

        Commands::List { archive, path } => {
            let (index, _rows) = open_or_build_index(&archive)?;
            let index = index.lock().map_err(|_| "index lock poisoned")?;
            let entries = index.list(&path)?;
            println!("{:<40} {:>10} {:>12}", "name", "mode", "size");
            for entry in entries {
                println!("{:<40} {:>10o} {:>12}", entry.name, entry.mode, entry.size);
            }
        }

        Commands::Stat { archive, path, version } => {
            let (index, _rows) = open_or_build_index(&archive)?;
            let index = index.lock().map_err(|_| "index lock poisoned")?;
            let (dir, name) = split_path(&path);
            match index.lookup(&dir, &name, version)? {
                Some(entry) => {
                    println!("path            {}", path);
                    println!("size            {}", entry.size);
                    println!("mode            {:o}", entry.mode);
                    println!("mtime           {}", entry.mtime);
                    println!("offset_header   {:?}", entry.offset_header);
                    println!("offset_data     {}", entry.offset_data);
                    println!("is_tar          {}", entry.is_tar);
                    println!("is_sparse       {}", entry.is_sparse);
                    println!("is_generated    {}", entry.is_generated);
                    if let Some(offset_header) = entry.offset_header {
                        let xattrs = ratarkit::mount::read_all_xattrs(&index, offset_header)?;
                        for (key, value) in xattrs {
                            println!("xattr           {key} = {} bytes", value.len());
                        }
                    }
                }
                None => {
                    eprintln!("not found: {path}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Cat { archive, path, version } => {
            let (index, _rows) = open_or_build_index(&archive)?;
            let archive_handle = open_archive_stream(&archive)?;
            let source = SQLiteIndexMountSource::new(index.clone(), archive_handle);
            let Some(entry) = source.lookup(&path, version) else {
                eprintln!("not found: {path}");
                std::process::exit(1);
            };
            let mut reader = source.open(&entry)?;
            std::io::copy(&mut reader, &mut std::io::stdout())?;
        }

        Commands::Verify { archive } => {
            let (index, rows) = open_or_build_index(&archive)?;
            let archive_handle = open_archive_stream(&archive)?;
            let source = SQLiteIndexMountSource::new(index.clone(), archive_handle);
            let entries = {
                let guard = index.lock().map_err(|_| "index lock poisoned")?;
                guard.list("/")?
            };
            let mut mismatches = 0u64;
            for entry in &entries {
                if entry.is_dir() || entry.is_generated {
                    continue;
                }
                let mut reader = match source.open(entry) {
                    Ok(r) => r,
                    Err(e) => {
                        eprintln!("  FAIL {}: {e}", entry.name);
                        mismatches += 1;
                        continue;
                    }
                };
                let mut buf = Vec::new();
                if let Err(e) = std::io::Read::read_to_end(&mut reader, &mut buf) {
                    eprintln!("  FAIL {}: {e}", entry.name);
                    mismatches += 1;
                    continue;
                }
                if buf.len() as u64 != entry.size {
                    eprintln!("  FAIL {}: expected {} bytes, read {}", entry.name, entry.size, buf.len());
                    mismatches += 1;
                }
            }
            println!("Verified {rows} indexed rows, {mismatches} mismatch(es)");
            if mismatches > 0 {
                std::process::exit(1);
            }
        }

        Commands::Info { archive } => {
            let candidates = locate_candidates(&archive, None, &default_index_folders());
            println!("Archive: {}", archive.display());
            println!("Index candidates, in order tried:");
            for candidate in &candidates {
                match candidate {
                    IndexCandidate::Path(p) => println!("  {}", p.display()),
                    IndexCandidate::Remote(uri) => println!("  remote: {uri}"),
                    IndexCandidate::Memory => println!("  :memory: (fallback)"),
                }
            }
            let (index, rows) = open_or_build_index(&archive)?;
            let guard = index.lock().map_err(|_| "index lock poisoned")?;
            println!("Schema version: {}", ratarkit::index::schema::SCHEMA_VERSION);
            println!("Backend:        {}", guard.backend_name());
            println!("Rows:           {rows}");
        }
    }

    Ok(())
}

fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

fn open_archive_stream(archive: &Path) -> Result<Arc<Mutex<dyn ratarkit::stencil::ReadSeek>>, Box<dyn std::error::Error>> {
    let file = std::fs::File::open(archive)?;
    Ok(ratarkit::stencil::shared(file))
}

fn build_index(
    archive: &Path,
    index_file: Option<PathBuf>,
    recursive: bool,
) -> Result<(Arc<Mutex<SQLiteIndex>>, u64), Box<dyn std::error::Error>> {
    let candidates = locate_candidates(archive, index_file, &default_index_folders());
    let candidate = candidates.into_iter().next().ok_or("no index candidate available")?;

    let mut index = SQLiteIndex::create(&candidate, "tar")?;
    let options = TarIndexOptions { mount_recursively: recursive, ..TarIndexOptions::default() };
    let indexer = TarIndexer::new(options);

    let mut file = std::fs::File::open(archive)?;
    let mut progress = |members: u64, _bytes: u64| {
        if members % 1000 == 0 {
            eprint!("\r  indexed {members} members");
        }
    };
    let archive_name = archive.file_name().and_then(|n| n.to_str());
    let rows = indexer.build(&mut file, &mut index, 0, 0, archive_name, Some(&mut progress))?;
    eprintln!();
    index.finalize()?;
    Ok((index.into_shared(), rows))
}

fn open_or_build_index(archive: &Path) -> Result<(Arc<Mutex<SQLiteIndex>>, i64), Box<dyn std::error::Error>> {
    let candidates = locate_candidates(archive, None, &default_index_folders());
    for candidate in &candidates {
        if let IndexCandidate::Path(path) = candidate {
            if path.exists() {
                match SQLiteIndex::open_existing(path, "tar") {
                    Ok(index) => {
                        let rows = index.row_count()?;
                        return Ok((index.into_shared(), rows));
                    }
                    Err(ratarkit::index::IndexOpenError::Invalid(reason)) => {
                        log::warn!("deleting invalid index {path:?}: {reason}");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    Err(ratarkit::index::IndexOpenError::Mismatching { found, expected }) => {
                        return Err(format!("index at {path:?} was built by {found}, not {expected}").into());
                    }
                }
            }
        }
    }
    let (index, rows) = build_index(archive, None, false)?;
    Ok((index, rows as i64))
}
