use anyhow::{anyhow, Context, Result};
use dbpf_core::package::compression;
use dbpf_core::package::resource::NAME_MAP_TYPE;
use dbpf_core::{NameMapResource, OpenOptions, ResourceKey, ResourceRegistry};
use log::{error, info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const USAGE: &str = "Usage: dbpf-tool <command> [args]

Available commands:
  info <file>              Dump the DBPF header and a compression summary
  list <file>              List live resources (names from the package name map)
  extract <file> <dir>     Write every live resource to <dir>
  delete <file> <T:G:I>    Delete one resource and save in place
  compact <file>           Rewrite the package in place
  scan <folder>            Check every .package under a folder

Environment:
  RUST_LOG                 Log filter (default: info)
  DBPF_MAX_RESOURCE_SIZE   Per-resource size ceiling in bytes";

fn open_options() -> OpenOptions {
    let mut opts = OpenOptions::new();
    if let Ok(value) = std::env::var("DBPF_MAX_RESOURCE_SIZE") {
        match value.parse::<u32>() {
            Ok(size) => opts = opts.max_resource_size(size),
            Err(e) => warn!("Ignoring DBPF_MAX_RESOURCE_SIZE={:?}: {}", value, e),
        }
    }
    opts
}

fn arg<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a str> {
    args.get(i)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("Missing <{}>\n\n{}", name, USAGE))
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("--help");

    match cmd {
        "info" => run_info(Path::new(arg(&args, 2, "file")?)),
        "list" => run_list(Path::new(arg(&args, 2, "file")?)),
        "extract" => run_extract(Path::new(arg(&args, 2, "file")?), Path::new(arg(&args, 3, "dir")?)),
        "delete" => {
            let key: ResourceKey = arg(&args, 3, "T:G:I")?.parse().map_err(|e| anyhow!("Invalid key: {}", e))?;
            run_delete(Path::new(arg(&args, 2, "file")?), &key)
        }
        "compact" => run_compact(Path::new(arg(&args, 2, "file")?)),
        "scan" => run_scan(Path::new(arg(&args, 2, "folder")?)),
        "--help" | "-h" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => Err(anyhow!("Unknown command: {}\n\n{}", cmd, USAGE)),
    }
}

fn run_info(path: &Path) -> Result<()> {
    let mut pkg = open_options().open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let header = pkg.header().clone();

    println!("Package: {}", path.display());
    println!("Version: {}.{}", header.major, header.minor);
    println!("Created: {}  Modified: {}", header.created, header.modified);
    println!("Index: {} entries, {} bytes at 0x{:08X}, type 0x{:02X}",
        header.index_count, header.index_size, header.resolved_index_position(), pkg.index_type());

    let entries: Vec<_> = pkg.live_entries().cloned().collect();
    let mut zlib = 0;
    let mut refpack = 0;
    let mut raw = 0;
    for entry in &entries {
        if entry.file_size == entry.mem_size {
            raw += 1;
            continue;
        }
        let head = pkg.read_raw(entry)?;
        match compression::detect(&head) {
            Some(dbpf_core::CompressionKind::Zlib) => zlib += 1,
            Some(dbpf_core::CompressionKind::RefPack) => refpack += 1,
            None => warn!("{} is flagged compressed but has unknown framing", entry.key),
        }
    }

    println!("\n--- Compression Summary ---");
    println!("Live entries: {}", entries.len());
    println!("Deleted slots: {}", pkg.entries().len() - entries.len());
    println!("Uncompressed: {}", raw);
    println!("Zlib: {}", zlib);
    println!("RefPack: {}", refpack);
    Ok(())
}

fn run_list(path: &Path) -> Result<()> {
    let mut pkg = open_options().open(path)?;
    let registry = ResourceRegistry::with_builtin();

    let mut names: HashMap<u64, String> = HashMap::new();
    let maps: Vec<ResourceKey> = pkg.live_entries()
        .filter(|e| e.key.res_type == NAME_MAP_TYPE)
        .map(|e| e.key)
        .collect();
    for key in maps {
        match pkg.read_resource(&key, &registry) {
            Ok(res) => {
                if let Some(map) = res.downcast_ref::<NameMapResource>() {
                    names.extend(map.entries.iter().map(|e| (e.instance, e.name.clone())));
                }
            }
            Err(e) => warn!("Skipping unreadable name map {}: {:?}", key, e),
        }
    }

    for entry in pkg.live_entries() {
        let name = names.get(&entry.key.instance).map(|s| s.as_str()).unwrap_or("");
        println!("{}  {:>10}  {:>10}  {}{}",
            entry.key,
            entry.mem_size,
            entry.file_size,
            if entry.is_compressed() { "z " } else { "  " },
            name);
    }
    Ok(())
}

fn run_extract(path: &Path, output_dir: &Path) -> Result<()> {
    info!("Extracting resources from: {:?}", path);
    let opts = open_options();
    let pkg = opts.open(path)?;
    let entries: Vec<_> = pkg.live_entries().cloned().collect();
    drop(pkg);

    std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;

    // Package holds a seekable handle, so each worker opens its own.
    entries.par_iter().try_for_each_init(
        || opts.open(path),
        |pkg, entry| -> Result<()> {
            let pkg = pkg.as_mut().map_err(|e| anyhow!("Failed to reopen {:?}: {}", path, e))?;
            let data = pkg.read_entry(entry)?.unwrap_or_default();
            let filename = format!("{:08X}_{:08X}_{:016X}.bin",
                entry.key.res_type, entry.key.res_group, entry.key.instance);
            std::fs::write(output_dir.join(filename), data)?;
            Ok(())
        },
    )?;

    info!("Extracted {} resources to {:?}", entries.len(), output_dir);
    Ok(())
}

fn run_delete(path: &Path, key: &ResourceKey) -> Result<()> {
    let mut pkg = open_options().writable(true).open(path)?;
    pkg.delete_resource(key)?;
    pkg.save().with_context(|| format!("Failed to save {:?}", path))?;
    info!("Deleted {} from {:?}", key, path);
    Ok(())
}

fn run_compact(path: &Path) -> Result<()> {
    let before = std::fs::metadata(path)?.len();
    let mut pkg = open_options().writable(true).open(path)?;
    let slots = pkg.entries().len();
    pkg.save().with_context(|| format!("Failed to save {:?}", path))?;
    let after = std::fs::metadata(path)?.len();
    info!("Compacted {:?}: {} -> {} entries, {} -> {} bytes", path, slots, pkg.len(), before, after);
    Ok(())
}

fn run_scan(folder: &Path) -> Result<()> {
    let files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "package"))
        .collect();

    if files.is_empty() {
        warn!("No .package files found in {:?}", folder);
        return Ok(());
    }
    info!("Scanning {} packages", files.len());

    let opts = open_options();
    let failures: Vec<(PathBuf, String)> = files
        .par_iter()
        .filter_map(|path| {
            let mut pkg = match opts.open(path) {
                Ok(p) => p,
                Err(e) => return Some((path.clone(), e.to_string())),
            };
            let entries: Vec<_> = pkg.live_entries().cloned().collect();
            let bad: Vec<String> = entries
                .iter()
                .filter_map(|entry| pkg.read_entry(entry).err().map(|e| e.to_string()))
                .collect();
            if bad.is_empty() {
                None
            } else {
                Some((path.clone(), format!("{} unreadable resources, first: {}", bad.len(), bad[0])))
            }
        })
        .collect();

    for (path, reason) in &failures {
        error!("{}: {}", path.display(), reason);
    }
    info!("Scan complete: {} ok, {} with problems", files.len() - failures.len(), failures.len());
    Ok(())
}
