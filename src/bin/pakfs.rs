//! pakfs command-line tool
//!
//! Creates containers and drives the filesystem projection from the shell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pakfs::core::validation::{file_name, join, normalize_path};
use pakfs::{EntryKind, PakConfig, PakFs};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pakfs")]
#[command(about = "Inspect and edit paged B-tree asset containers")]
struct Args {
    /// Path to the container file
    container: PathBuf,

    /// Open the container read-only
    #[arg(long, global = true)]
    read_only: bool,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty container
    Create {
        /// Block size in bytes (overrides the config file)
        #[arg(long)]
        block_size: Option<u32>,

        /// Key width in bytes (overrides the config file)
        #[arg(long)]
        key_width: Option<u16>,
    },

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// Show kind and size
        #[arg(short, long)]
        long: bool,
    },

    /// Write a file's content to stdout
    Cat { path: String },

    /// Store a local file (or stdin with `-`) at a container path
    Put { path: String, source: PathBuf },

    /// Remove a file or an empty directory
    Rm { path: String },

    /// Move a file or directory
    Mv { from: String, to: String },

    /// Create a directory
    Mkdir {
        path: String,

        /// Create missing parents as well
        #[arg(short, long)]
        parents: bool,
    },

    /// Show attributes of a path
    Stat {
        path: String,

        #[arg(long)]
        json: bool,
    },

    /// Show container statistics
    Df {
        #[arg(long)]
        json: bool,
    },

    /// Copy a local directory tree into the container
    Import {
        source: PathBuf,

        #[arg(default_value = "/")]
        dest: String,
    },

    /// Copy container files below a path into a local directory
    Export {
        path: String,
        dest: PathBuf,
    },

    /// Validate the tree and account for every block
    Check {
        /// Return leaked blocks to the free list
        #[arg(long)]
        repair: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PakConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PakConfig::default(),
    };
    config.read_only |= args.read_only;

    if let Command::Create {
        block_size,
        key_width,
    } = &args.command
    {
        if let Some(block_size) = block_size {
            config.block_size = *block_size;
        }
        if let Some(key_width) = key_width {
            config.key_width = *key_width;
        }
        let pak = PakFs::create(&args.container, config)
            .with_context(|| format!("creating {}", args.container.display()))?;
        pak.close()?;
        println!("created {}", args.container.display());
        return Ok(());
    }

    let pak = PakFs::open(&args.container, config)
        .with_context(|| format!("opening {}", args.container.display()))?;
    let outcome = run(&pak, args.command);
    pak.close().context("closing container")?;
    outcome
}

fn run(pak: &PakFs, command: Command) -> Result<()> {
    match command {
        Command::Create { .. } => unreachable!("handled before the container is opened"),

        Command::Ls { path, long } => {
            for entry in pak.readdir(&path)? {
                if long {
                    let child = join(&normalize_path(&path)?, &entry.name);
                    let attr = pak.getattr(&child)?;
                    let kind = match attr.kind {
                        EntryKind::File => '-',
                        EntryKind::Directory => 'd',
                    };
                    println!("{} {:>12} {}", kind, attr.size, entry.name);
                } else if entry.kind == EntryKind::Directory {
                    println!("{}/", entry.name);
                } else {
                    println!("{}", entry.name);
                }
            }
        }

        Command::Cat { path } => {
            let content = pak.read_file(&path)?;
            io::stdout().lock().write_all(&content)?;
        }

        Command::Put { path, source } => {
            let content = if source.as_os_str() == "-" {
                let mut buf = Vec::new();
                io::stdin().lock().read_to_end(&mut buf)?;
                buf
            } else {
                fs::read(&source).with_context(|| format!("reading {}", source.display()))?
            };
            let attr = pak.write_file(&path, &content, None)?;
            info!(path = %attr.path, size = attr.size, "stored file");
        }

        Command::Rm { path } => {
            if pak.getattr(&path)?.is_dir() {
                pak.rmdir(&path, None)?;
            } else {
                pak.unlink(&path, None)?;
            }
        }

        Command::Mv { from, to } => pak.rename(&from, &to, None)?,

        Command::Mkdir { path, parents } => {
            if parents {
                let path = normalize_path(&path)?;
                let mut current = String::new();
                for component in path.split('/').filter(|c| !c.is_empty()) {
                    current.push('/');
                    current.push_str(component);
                    if !pak.exists(&current)? {
                        pak.mkdir(&current, None)?;
                    }
                }
            } else {
                pak.mkdir(&path, None)?;
            }
        }

        Command::Stat { path, json } => {
            let attr = pak.getattr(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&attr)?);
            } else {
                let modified = chrono::DateTime::from_timestamp(attr.modified, 0)
                    .map(|time| time.to_rfc3339())
                    .unwrap_or_default();
                println!("path:     {}", attr.path);
                println!("kind:     {:?}", attr.kind);
                println!("size:     {}", attr.size);
                println!("modified: {}", modified);
                println!("tag:      {}", attr.tag);
                println!("id:       {}", attr.id);
            }
        }

        Command::Df { json } => {
            let stats = pak.statfs();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("block size:  {}", stats.block_size);
                println!("blocks:      {}", stats.block_count);
                println!("free blocks: {}", stats.free_blocks);
                println!("files:       {}", stats.files);
                println!("total size:  {}", stats.total_size);
                println!("commit seq:  {}", stats.commit_seq);
            }
        }

        Command::Import { source, dest } => {
            let dest = normalize_path(&dest)?;
            let count = import_dir(pak, &source, &dest)?;
            println!("imported {} files", count);
        }

        Command::Export { path, dest } => {
            let root = normalize_path(&path)?;
            let files = pak.files_under(&root)?;
            for attr in &files {
                let relative = if attr.path == root {
                    file_name(&attr.path)
                } else {
                    attr.path[root.len()..].trim_start_matches('/')
                };
                let target = dest.join(relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, pak.read_file(&attr.path)?)
                    .with_context(|| format!("writing {}", target.display()))?;
            }
            println!("exported {} files", files.len());
        }

        Command::Check { repair } => {
            let report = if repair {
                pak.session().repair()?
            } else {
                pak.session().check()?
            };
            println!("commit seq: {}", report.commit_seq);
            println!("blocks:     {}", report.block_count);
            println!("height:     {}", report.height);
            println!("entries:    {}", report.entries);
            println!("reachable:  {}", report.reachable);
            println!("free:       {}", report.free);
            println!("pending:    {}", report.pending);
            println!("leaked:     {}", report.leaked.len());
            if !report.is_clean() && !repair {
                bail!(
                    "{} leaked blocks; run `check --repair` to reclaim them",
                    report.leaked.len()
                );
            }
        }
    }
    Ok(())
}

fn import_dir(pak: &PakFs, source: &Path, dest: &str) -> Result<usize> {
    let mut count = 0;
    let mut entries: Vec<_> = fs::read_dir(source)
        .with_context(|| format!("reading {}", source.display()))?
        .collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            bail!("{} is not valid UTF-8", entry.path().display());
        };
        let target = join(dest, name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            count += import_dir(pak, &entry.path(), &target)?;
        } else if file_type.is_file() {
            let content = fs::read(entry.path())?;
            pak.write_file(&target, &content, None)?;
            count += 1;
        }
    }
    Ok(count)
}
