//! MailFS FUSE Host: mounts a mail folder as a Linux/macOS filesystem
//!
//! The first argument is a mailbox URL such as
//! `imaps://me=example.com@imap.example.com/Files`; `memory://` mounts a
//! throwaway in-process store.

#[cfg(feature = "fuse")]
mod adapter;
#[cfg(feature = "imap")]
mod imap;
#[cfg(any(feature = "fuse", test))]
mod inodes;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mailfs_core::{FsConfig, InMemoryMailStore, MailFs, MailStore, MailboxTarget};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mailfs", about = "Mount a mail folder as a filesystem")]
struct Args {
    /// Mailbox URL: imap://, imaps:// or memory://
    url: String,

    /// Mount point for the filesystem
    #[arg(required_unless_present = "print_tree")]
    mount_point: Option<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for locally staged file contents
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Log every filesystem operation
    #[arg(short, long)]
    verbose: bool,

    /// Print the folder tree and exit instead of mounting
    #[arg(long)]
    print_tree: bool,
}

fn load_config(config_path: Option<PathBuf>) -> Result<FsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: FsConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FsConfig::default()),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store(target: &MailboxTarget) -> Result<Arc<dyn MailStore>> {
    match target.scheme.as_str() {
        "memory" => Ok(Arc::new(InMemoryMailStore::new())),
        #[cfg(feature = "imap")]
        "imap" | "imaps" => Ok(Arc::new(imap::ImapMailStore::connect(target)?)),
        #[cfg(not(feature = "imap"))]
        "imap" | "imaps" => {
            bail!("IMAP support not compiled in; build with: cargo build --features imap")
        }
        other => bail!("unsupported mailbox scheme: {}", other),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("Starting MailFS FUSE Host");

    let mut config = load_config(args.config)?;
    if let Some(dir) = args.staging_dir {
        config.staging_dir = dir;
    }
    info!("Configuration loaded: {:?}", config);

    let target = MailboxTarget::parse(&args.url)?.with_env_credentials();
    info!(?target, "Opening mailbox");
    let store = open_store(&target)?;
    let fs = Arc::new(MailFs::new(store, &target.folder, config)?);

    if args.print_tree {
        for line in fs.root().tree_lines()? {
            println!("{}", line);
        }
        return Ok(());
    }

    let Some(mount_point) = args.mount_point else {
        bail!("a mount point is required");
    };
    info!("Mount point: {}", mount_point.display());

    #[cfg(feature = "fuse")]
    {
        let filesystem = adapter::MailFsFuse::new(fs);

        let mut mount_options = vec![
            fuser::MountOption::FSName("mailfs".to_string()),
            fuser::MountOption::Subtype("mailfs".to_string()),
        ];

        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }

        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }

        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("Mounting filesystem...");
        fuser::mount2(filesystem, &mount_point, &mount_options)?;
    }

    #[cfg(not(feature = "fuse"))]
    {
        let _ = (fs, args.allow_other, args.allow_root, args.auto_unmount);
        warn!("FUSE support not compiled in; use --print-tree or rebuild with --features fuse");
    }

    Ok(())
}
