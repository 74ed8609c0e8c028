//! # oxipage CLI
//!
//! Minimal administrative surface over an oxipage volume directory.
//!
//! ## Usage
//!
//! ```bash
//! # Create a new volume directory
//! oxipage create ./vol
//!
//! # Show pointer and allocation state
//! oxipage info ./vol
//!
//! # Advance the volume log's trim pointer
//! oxipage trim ./vol 4096
//!
//! # Run crash recovery and drain the recycler
//! oxipage recover ./vol
//! ```
//!
//! Exits 0 on success; nonzero with a stable error string on stderr.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use oxipage::allocator::PageAllocator;
use oxipage::cache::PageCache;
use oxipage::config::OxipageConfig;
use oxipage::device::{FileDevice, PageFile};
use oxipage::log::LogDevice;
use oxipage::page::PageDevice;
use oxipage::recycler::{PageRecycler, PrefixRefTracer};
use oxipage::volume::Volume;
use oxipage::{OxipageError, Result};

const MANIFEST: &str = "oxipage.toml";
const VOLUME_LOG: &str = "volume.log";
const ALLOCATOR_LOG: &str = "alloc-0.log";
const PAGE_FILE: &str = "pages-0.dat";
const RECYCLER_LOG: &str = "recycler.log";

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "--version" | "-v" => {
            println!("oxipage {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "create" => {
            let dir = required_arg(&args, 2, "create <dir>")?;
            cmd_create(Path::new(&dir))
        }
        "info" => {
            let dir = required_arg(&args, 2, "info <dir>")?;
            cmd_info(Path::new(&dir))
        }
        "trim" => {
            let dir = required_arg(&args, 2, "trim <dir> <offset>")?;
            let offset = required_arg(&args, 3, "trim <dir> <offset>")?
                .parse::<u64>()
                .map_err(|_| OxipageError::InvalidArgument("offset must be an integer"))?;
            cmd_trim(Path::new(&dir), offset)
        }
        "recover" => {
            let dir = required_arg(&args, 2, "recover <dir>")?;
            cmd_recover(Path::new(&dir))
        }
        _ => {
            print_usage();
            Err(OxipageError::InvalidArgument("unknown subcommand"))
        }
    }
}

fn required_arg(args: &[String], index: usize, usage: &'static str) -> Result<String> {
    args.get(index).cloned().ok_or_else(|| {
        eprintln!("usage: oxipage {usage}");
        OxipageError::InvalidArgument("missing argument")
    })
}

fn print_usage() {
    println!("oxipage - crash-safe storage building blocks");
    println!();
    println!("usage:");
    println!("  oxipage create <dir>          create a new volume directory");
    println!("  oxipage info <dir>            show log pointers and page counts");
    println!("  oxipage trim <dir> <offset>   advance the volume log trim pointer");
    println!("  oxipage recover <dir>         replay logs and drain the recycler");
}

fn manifest(dir: &Path) -> Result<OxipageConfig> {
    OxipageConfig::load_from_path(dir.join(MANIFEST))
}

fn file_device(dir: &Path, name: &str, create: bool) -> Result<Arc<FileDevice>> {
    Ok(Arc::new(FileDevice::open(dir.join(name), create)?))
}

fn cmd_create(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let manifest_path = dir.join(MANIFEST);
    if manifest_path.exists() {
        return Err(OxipageError::InvalidArgument(
            "directory already holds a volume",
        ));
    }
    let config = OxipageConfig::default();
    config.save_to_path(&manifest_path)?;

    let page_device = page_device(dir, &config, true)?;
    let allocator = Arc::new(PageAllocator::create(
        0,
        file_device(dir, ALLOCATOR_LOG, true)?,
        config.allocator_config(),
    )?);
    let cache = Arc::new(PageCache::new(
        config.cache_config(),
        HashMap::from([(0u8, Arc::clone(&page_device))]),
    ));
    let volume = Volume::create(
        file_device(dir, VOLUME_LOG, true)?,
        config.volume_config(),
        Arc::clone(&cache),
        HashMap::from([(0u8, Arc::clone(&allocator))]),
    )?;
    let recycler = PageRecycler::create(
        file_device(dir, RECYCLER_LOG, true)?,
        config.recycler_config(),
        HashMap::from([(0u8, Arc::clone(&allocator))]),
        HashMap::from([(0u8, page_device)]),
        Arc::new(PrefixRefTracer),
    )?;

    recycler.close()?;
    volume.close()?;
    allocator.close()?;
    println!("created volume at {}", dir.display());
    Ok(())
}

fn page_device(dir: &Path, config: &OxipageConfig, create: bool) -> Result<Arc<PageDevice>> {
    let backing = file_device(dir, PAGE_FILE, create)?;
    let page_size = config.page_size();
    let page_count = config.allocator_config().page_count as u64;
    let pages = if create {
        PageFile::create(backing, page_size, page_count)?
    } else {
        PageFile::open(backing, page_size, page_count)?
    };
    Ok(Arc::new(PageDevice::new(0, Arc::new(pages))))
}

fn cmd_info(dir: &Path) -> Result<()> {
    let config = manifest(dir)?;
    let volume_log = LogDevice::open(file_device(dir, VOLUME_LOG, false)?)?;
    let stats = volume_log.stats();
    println!("volume log:");
    println!("  trim_pos:   {}", stats.trim_pos);
    println!("  flush_pos:  {}", stats.flush_pos);
    println!("  commit_pos: {}", stats.commit_pos);
    println!("  capacity:   {}", stats.capacity);
    println!("  available:  {}", stats.available());
    volume_log.close()?;

    let allocator = PageAllocator::open(
        0,
        file_device(dir, ALLOCATOR_LOG, false)?,
        config.allocator_config(),
    )?;
    let mut free = 0u64;
    let mut garbage = 0u64;
    let mut live = 0u64;
    for index in 0..allocator.page_count() {
        match allocator.entry_at(index)?.ref_count {
            0 => free += 1,
            1 => garbage += 1,
            _ => live += 1,
        }
    }
    println!("pages (device 0):");
    println!("  free:    {free}");
    println!("  garbage: {garbage}");
    println!("  live:    {live}");
    allocator.close()?;
    Ok(())
}

fn cmd_trim(dir: &Path, offset: u64) -> Result<()> {
    let volume_log = LogDevice::open(file_device(dir, VOLUME_LOG, false)?)?;
    volume_log.trim(offset)?;
    // The trim itself is O(1); the close barrier persists it.
    volume_log.close()?;
    println!("trimmed volume log to {offset}");
    Ok(())
}

fn cmd_recover(dir: &Path) -> Result<()> {
    let config = manifest(dir)?;
    let page_device = page_device(dir, &config, false)?;
    let allocator = Arc::new(PageAllocator::open(
        0,
        file_device(dir, ALLOCATOR_LOG, false)?,
        config.allocator_config(),
    )?);
    let cache = Arc::new(PageCache::new(
        config.cache_config(),
        HashMap::from([(0u8, Arc::clone(&page_device))]),
    ));

    let (volume, report) = Volume::open(
        file_device(dir, VOLUME_LOG, false)?,
        Arc::clone(&cache),
        HashMap::from([(0u8, Arc::clone(&allocator))]),
    )?;
    println!("volume recovery:");
    println!("  committed:   {}", report.committed);
    println!("  aborted:     {}", report.aborted);
    println!("  compensated: {}", report.compensated);

    let recycler = PageRecycler::open(
        file_device(dir, RECYCLER_LOG, false)?,
        config.recycler_config(),
        HashMap::from([(0u8, Arc::clone(&allocator))]),
        HashMap::from([(0u8, page_device)]),
        Arc::new(PrefixRefTracer),
    )?;
    let reconciled = recycler.reconcile_garbage()?;
    println!("recycler: reconciled {reconciled} garbage pages");
    recycler.await_quiescent_timeout(Duration::from_secs(60))?;
    println!("recycler: quiescent");

    recycler.close()?;
    volume.close()?;
    allocator.close()?;
    Ok(())
}
