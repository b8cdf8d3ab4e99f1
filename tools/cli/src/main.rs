//! Stowage CLI - storage gateway operations from the command line.
//!
//! Local directories are mounted as named providers; every location is
//! written `NAME:/path`, with a trailing `/` for folders.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stowage_common::{GatewayConfig, LinkBuilder, Metadata, StoragePath};
use stowage_storage::transfer::{self, TransferKind, TransferOptions};
use stowage_storage::{create_default_registry, ConflictPolicy, DownloadOptions, Provider};
use stowage_stream::{ByteRange, ByteStream, FileStream};
use stowage_tasks::{Submission, TaskPool, TaskRequest, TaskStatus};

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Stowage - one interface over many storage backends")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Mount a local directory as provider NAME (NAME=DIR, repeatable).
    #[arg(short, long = "mount", value_name = "NAME=DIR")]
    mounts: Vec<String>,

    /// Serve mounted provider NAME read-only (repeatable).
    #[arg(long = "read-only", value_name = "NAME")]
    read_only: Vec<String>,

    /// Gateway configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a folder.
    Ls {
        /// Folder location, e.g. home:/docs/
        location: String,
    },

    /// Show metadata of a file or folder.
    Stat {
        location: String,

        /// Revision to describe instead of the current version.
        #[arg(short, long)]
        revision: Option<String>,
    },

    /// Download a file.
    Get {
        location: String,

        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Byte range, e.g. "bytes=0-1023".
        #[arg(long)]
        range: Option<String>,

        #[arg(short, long)]
        revision: Option<String>,
    },

    /// Upload a local file.
    Put {
        /// Local file to upload.
        file: PathBuf,

        /// Destination file, or folder to upload into.
        location: String,

        /// Conflict policy: replace, keep or warn.
        #[arg(long, default_value = "replace")]
        conflict: ConflictPolicy,
    },

    /// Create a folder.
    Mkdir { location: String },

    /// Delete a file or folder tree.
    Rm {
        location: String,

        /// Required to delete the root of a provider.
        #[arg(long)]
        confirm_root: bool,
    },

    /// Copy a file or folder, possibly across providers.
    Cp(TransferArgs),

    /// Move a file or folder, possibly across providers.
    Mv(TransferArgs),

    /// List revisions of a file.
    Revisions { location: String },

    /// Download a folder as a zip archive.
    Zip {
        location: String,

        /// Output archive.
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(clap::Args)]
struct TransferArgs {
    from: String,
    to: String,

    /// Conflict policy: replace, keep or warn.
    #[arg(long, default_value = "replace")]
    conflict: ConflictPolicy,

    /// New name when the destination is a folder.
    #[arg(long)]
    rename: Option<String>,

    /// Run as a background task and poll until it finishes.
    #[arg(short, long)]
    background: bool,
}

/// Mounted providers by name.
struct Mounts {
    config: GatewayConfig,
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Mounts {
    fn new(config: GatewayConfig, mounts: &[String], read_only: &[String]) -> Result<Self> {
        let registry = create_default_registry(&config)?;
        let mut providers = HashMap::new();

        for mount in mounts {
            let (name, dir) = parse_mount(mount)?;
            let settings = json!({
                "root": dir,
                "name": name,
                "read_only": read_only.iter().any(|r| r == name),
            });
            let provider = registry
                .resolve("local", settings)
                .with_context(|| format!("Failed to mount {}", mount))?;
            info!("Mounted {} at {}", name, dir);
            providers.insert(name.to_string(), provider);
        }
        for name in read_only {
            if !providers.contains_key(name) {
                bail!("--read-only {}: no such mount", name);
            }
        }

        Ok(Self { config, providers })
    }

    /// Resolve `NAME:/path` to its provider and a lenient path.
    async fn locate(&self, location: &str) -> Result<(Arc<dyn Provider>, StoragePath)> {
        let (provider, raw) = self.provider(location)?;
        let path = provider
            .validate_path(raw)
            .await
            .with_context(|| format!("Invalid location {}", location))?;
        Ok((provider, path))
    }

    /// Resolve `NAME:/path` and check it exists with the kind written.
    async fn locate_existing(&self, location: &str) -> Result<(Arc<dyn Provider>, StoragePath)> {
        let (provider, raw) = self.provider(location)?;
        let path = provider
            .validate_v1_path(raw)
            .await
            .with_context(|| format!("No such location {}", location))?;
        Ok((provider, path))
    }

    fn provider<'a>(&self, location: &'a str) -> Result<(Arc<dyn Provider>, &'a str)> {
        let (name, raw) = parse_location(location)?;
        let provider = self
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown provider '{}'; mount it with --mount", name))?;
        Ok((provider, raw))
    }

    fn render(&self, provider: &dyn Provider, metadata: &Metadata) -> Value {
        let links = LinkBuilder::new(&self.config.links).links(metadata, provider.capabilities());
        metadata.serialize(Some(&links))
    }
}

fn parse_mount(mount: &str) -> Result<(&str, &str)> {
    match mount.split_once('=') {
        Some((name, dir)) if !name.is_empty() && !dir.is_empty() && !name.contains(':') => {
            Ok((name, dir))
        }
        _ => bail!("Invalid mount '{}', expected NAME=DIR", mount),
    }
}

fn parse_location(location: &str) -> Result<(&str, &str)> {
    match location.split_once(':') {
        Some((name, path)) if !name.is_empty() && path.starts_with('/') => Ok((name, path)),
        _ => bail!("Invalid location '{}', expected NAME:/path", location),
    }
}

fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            GatewayConfig::from_json(&text).context("Invalid config")
        }
        None => Ok(GatewayConfig::default()),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let mounts = Mounts::new(config, &cli.mounts, &cli.read_only)?;

    match cli.command {
        Commands::Ls { location } => cmd_ls(&mounts, &location).await,
        Commands::Stat { location, revision } => {
            cmd_stat(&mounts, &location, revision.as_deref()).await
        }
        Commands::Get {
            location,
            output,
            range,
            revision,
        } => cmd_get(&mounts, &location, output.as_deref(), range.as_deref(), revision).await,
        Commands::Put {
            file,
            location,
            conflict,
        } => cmd_put(&mounts, &file, &location, conflict).await,
        Commands::Mkdir { location } => cmd_mkdir(&mounts, &location).await,
        Commands::Rm {
            location,
            confirm_root,
        } => cmd_rm(&mounts, &location, confirm_root).await,
        Commands::Cp(args) => cmd_transfer(&mounts, TransferKind::Copy, args).await,
        Commands::Mv(args) => cmd_transfer(&mounts, TransferKind::Move, args).await,
        Commands::Revisions { location } => cmd_revisions(&mounts, &location).await,
        Commands::Zip { location, output } => cmd_zip(&mounts, &location, &output).await,
    }
}

/// List a folder.
async fn cmd_ls(mounts: &Mounts, location: &str) -> Result<()> {
    let (provider, path) = mounts.locate_existing(location).await?;
    if !path.is_folder() {
        bail!("{} is not a folder", location);
    }

    let listing = provider
        .metadata(&path, None)
        .await?
        .listing()
        .unwrap_or_default();

    if listing.is_empty() {
        println!("Folder is empty.");
    } else {
        println!("Contents of {}:", location);
        for entry in listing {
            match entry.size() {
                Some(size) => println!("  [FILE] {} ({} bytes)", entry.name(), size),
                None => println!("  [DIR]  {}/", entry.name()),
            }
        }
    }

    Ok(())
}

/// Show metadata as JSON.
async fn cmd_stat(mounts: &Mounts, location: &str, revision: Option<&str>) -> Result<()> {
    let (provider, path) = mounts.locate_existing(location).await?;

    let value = match provider.metadata(&path, revision).await? {
        stowage_common::MetadataResponse::Entry(metadata) => {
            mounts.render(provider.as_ref(), &metadata)
        }
        stowage_common::MetadataResponse::Listing(children) => Value::Array(
            children
                .iter()
                .map(|child| mounts.render(provider.as_ref(), child))
                .collect(),
        ),
    };
    print_json(&value)
}

/// Download a file to disk or stdout.
async fn cmd_get(
    mounts: &Mounts,
    location: &str,
    output: Option<&Path>,
    range: Option<&str>,
    revision: Option<String>,
) -> Result<()> {
    let (provider, path) = mounts.locate_existing(location).await?;

    let range = range
        .map(|r| ByteRange::parse(r).ok_or_else(|| anyhow!("Unsupported range '{}'", r)))
        .transpose()?;
    let options = DownloadOptions { range, revision };

    let mut stream = provider
        .download(&path, options)
        .await
        .context("Failed to download")?;

    let written = match output {
        Some(output) => {
            let mut file = tokio::fs::File::create(output)
                .await
                .context("Failed to create output file")?;
            copy_to(stream.as_mut(), &mut file, mounts.config.stream.chunk_size).await?
        }
        None => {
            let mut stdout = tokio::io::stdout();
            copy_to(stream.as_mut(), &mut stdout, mounts.config.stream.chunk_size).await?
        }
    };
    info!("Downloaded {} ({} bytes)", location, written);

    Ok(())
}

async fn copy_to<W: AsyncWrite + Unpin>(
    stream: &mut dyn ByteStream,
    writer: &mut W,
    chunk_size: usize,
) -> Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = stream.read(chunk_size).await? {
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

/// Upload a local file.
async fn cmd_put(
    mounts: &Mounts,
    file: &Path,
    location: &str,
    conflict: ConflictPolicy,
) -> Result<()> {
    let (provider, mut path) = mounts.locate(location).await?;
    if path.is_folder() {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Cannot name upload from {}", file.display()))?;
        path = provider.revalidate_path(&path, name, false).await?;
    }

    let stream = FileStream::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let (metadata, created) = provider
        .upload(Box::new(stream), &path, conflict)
        .await
        .context("Failed to upload")?;

    println!(
        "{} {} ({} bytes)",
        if created { "Created" } else { "Updated" },
        metadata.materialized_path(),
        metadata.size().unwrap_or_default()
    );
    Ok(())
}

/// Create a folder.
async fn cmd_mkdir(mounts: &Mounts, location: &str) -> Result<()> {
    let (provider, path) = mounts.locate(location).await?;
    let metadata = provider
        .create_folder(&path)
        .await
        .context("Failed to create folder")?;

    println!("Folder created: {}", metadata.materialized_path());
    Ok(())
}

/// Delete a file or folder.
async fn cmd_rm(mounts: &Mounts, location: &str, confirm_root: bool) -> Result<()> {
    let (provider, path) = mounts.locate_existing(location).await?;
    provider
        .delete(&path, confirm_root)
        .await
        .context("Failed to delete")?;

    println!("Removed: {}", location);
    Ok(())
}

/// Copy or move, inline or as a background task.
async fn cmd_transfer(mounts: &Mounts, kind: TransferKind, args: TransferArgs) -> Result<()> {
    let (source, src) = mounts.locate_existing(&args.from).await?;
    let (dest, dst) = mounts.locate(&args.to).await?;
    let options = TransferOptions {
        rename: args.rename,
        conflict: args.conflict,
    };

    if !args.background {
        let (metadata, created) =
            transfer::transfer(kind, source.as_ref(), dest.as_ref(), &src, &dst, &options).await?;
        report_transfer(kind, &metadata, created);
        return Ok(());
    }

    let pool = TaskPool::new(&mounts.config.tasks);
    let request = TaskRequest {
        kind,
        source,
        dest,
        src,
        dst,
        options,
    };

    let status = match pool.submit_and_wait(request).await? {
        Submission::Completed(status) => status,
        Submission::Accepted(id) => {
            println!("Task {} accepted", id);
            loop {
                let status = pool.wait(&id, Duration::from_secs(1)).await?;
                if status.state.is_terminal() {
                    break status;
                }
                println!("Task {}: {}", id, status.state);
            }
        }
    };
    pool.shutdown().await;
    report_task(kind, status)
}

fn report_transfer(kind: TransferKind, metadata: &Metadata, created: bool) {
    println!(
        "{} to {}:{} ({})",
        match kind {
            TransferKind::Copy => "Copied",
            TransferKind::Move => "Moved",
        },
        metadata.provider(),
        metadata.materialized_path(),
        if created { "created" } else { "overwritten" }
    );
}

fn report_task(kind: TransferKind, status: TaskStatus) -> Result<()> {
    match (status.result, status.error) {
        (Some(result), _) => {
            report_transfer(kind, &result.metadata, result.created);
            Ok(())
        }
        (None, Some(error)) => bail!("Task {} failed: {} ({})", status.id, error.message, error.code),
        (None, None) => bail!("Task {} ended as {}", status.id, status.state),
    }
}

/// List revisions of a file.
async fn cmd_revisions(mounts: &Mounts, location: &str) -> Result<()> {
    let (provider, path) = mounts.locate_existing(location).await?;
    let revisions = provider
        .revisions(&path)
        .await
        .context("Failed to list revisions")?;

    print_json(&Value::Array(
        revisions.iter().map(|revision| revision.serialize()).collect(),
    ))
}

/// Write a folder as a zip archive.
async fn cmd_zip(mounts: &Mounts, location: &str, output: &Path) -> Result<()> {
    let (provider, path) = mounts.locate_existing(location).await?;
    let mut archive = transfer::zip(provider, &path).await?;

    let mut file = tokio::fs::File::create(output)
        .await
        .context("Failed to create archive")?;
    let written = copy_to(&mut archive, &mut file, mounts.config.stream.chunk_size).await?;

    println!("Archive written: {} ({} bytes)", output.display(), written);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("home:/docs/").unwrap(), ("home", "/docs/"));
        assert_eq!(parse_location("a:/x:y.txt").unwrap(), ("a", "/x:y.txt"));
        assert!(parse_location("/docs/").is_err());
        assert!(parse_location("home:docs").is_err());
    }

    #[test]
    fn test_parse_mount() {
        assert_eq!(parse_mount("home=/tmp/x").unwrap(), ("home", "/tmp/x"));
        assert!(parse_mount("home").is_err());
        assert!(parse_mount("=/tmp").is_err());
        assert!(parse_mount("a:b=/tmp").is_err());
    }
}
