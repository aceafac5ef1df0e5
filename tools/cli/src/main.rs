//! Polystore CLI - Command line access to every configured store.
//!
//! Paths are logical paths: `s3://bucket/key`, `//server/share/dir/file`,
//! `https://account.blob.core.windows.net/container/blob`, or a plain local
//! path for anything no configured provider claims.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use polystore_common::Error;
use polystore_storage::{ByteStream, ComboFacade, FacadeFactory, StorageFilter};

use crate::config::ProvidersFile;

#[derive(Parser)]
#[command(name = "polystore")]
#[command(about = "Polystore - One path scheme for local, SMB, blob and S3 storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Provider file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List files under a path.
    Ls {
        /// Descend into subdirectories.
        #[arg(short, long)]
        recursive: bool,

        /// Keep files ending with this extension (repeatable).
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Keep files whose path matches this regex (repeatable).
        #[arg(long)]
        regex: Vec<String>,

        path: String,
    },

    /// Show metadata of a file or directory.
    Stat { path: String },

    /// Write a file's contents to stdout.
    Cat { path: String },

    /// Upload a local file.
    Put {
        /// Create missing parent directories.
        #[arg(long)]
        mkdirs: bool,

        /// Re-read the stored object and compare checksums.
        #[arg(long)]
        verify: bool,

        /// Local source file.
        source: PathBuf,

        /// Destination logical path.
        path: String,
    },

    /// Delete a file.
    Rm { path: String },

    /// Print the base64 MD5 of a stored file.
    Checksum { path: String },
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
        .compact()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let combo = open_combo(cli.config.as_deref())?;

    match cli.command {
        Commands::Ls {
            recursive,
            extensions,
            regex,
            path,
        } => cmd_ls(&combo, &path, recursive, extensions, regex).await,

        Commands::Stat { path } => cmd_stat(&combo, &path).await,

        Commands::Cat { path } => cmd_cat(&combo, &path).await,

        Commands::Put {
            mkdirs,
            verify,
            source,
            path,
        } => cmd_put(&combo, &source, &path, mkdirs, verify).await,

        Commands::Rm { path } => cmd_rm(&combo, &path).await,

        Commands::Checksum { path } => cmd_checksum(&combo, &path).await,
    }
}

/// Backends available to this build.
#[cfg(feature = "smb")]
fn factory() -> FacadeFactory {
    let connector = std::sync::Arc::new(polystore_storage::smb::PavaoConnector::new());
    FacadeFactory::with_defaults().with_smb_connector(connector)
}

/// Backends available to this build; SMB needs the `smb` feature.
#[cfg(not(feature = "smb"))]
fn factory() -> FacadeFactory {
    FacadeFactory::with_defaults()
}

/// Build the combo facade from the provider file, if any.
fn open_combo(config: Option<&std::path::Path>) -> Result<ComboFacade> {
    let providers = match config {
        Some(path) => ProvidersFile::load(path)?,
        None => ProvidersFile::default(),
    };

    let factory = factory();
    let combo = ComboFacade::from_configs(&factory, &providers.providers)
        .context("Failed to initialize storage providers")?;

    for facade in combo.members() {
        info!("Storage {} ({})", facade.name(), facade.kind());
    }
    Ok(combo)
}

/// List files under a path.
async fn cmd_ls(
    combo: &ComboFacade,
    path: &str,
    recursive: bool,
    extensions: Vec<String>,
    regex: Vec<String>,
) -> Result<()> {
    let filter = if extensions.is_empty() && regex.is_empty() {
        None
    } else {
        let mut builder = StorageFilter::builder();
        for extension in extensions {
            builder = builder.extension(extension);
        }
        for pattern in regex {
            builder = builder.regex(pattern);
        }
        Some(builder.build()?)
    };

    let mut entries = combo.enumerate(path, recursive, filter.as_ref());
    let mut count = 0usize;
    while let Some(descriptor) = entries
        .try_next()
        .await
        .with_context(|| format!("Failed to list {}", path))?
    {
        println!("{}", descriptor);
        count += 1;
    }

    info!("{} file(s)", count);
    Ok(())
}

/// Show metadata of a path.
async fn cmd_stat(combo: &ComboFacade, path: &str) -> Result<()> {
    match combo.stat(path).await {
        Ok(descriptor) => {
            println!("Name:      {}", descriptor.name);
            println!("Path:      {}", descriptor.logical_path);
            println!("Type:      {}", if descriptor.is_file { "file" } else { "directory" });
            println!("Size:      {} bytes", descriptor.size_bytes);
            println!("Modified:  {}", descriptor.timestamp.to_rfc3339());
            println!("MIME type: {}", descriptor.mime_type());
            Ok(())
        }
        Err(Error::NotFound(_)) => anyhow::bail!("No such file or directory: {}", path),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path)),
    }
}

/// Stream a file to stdout.
async fn cmd_cat(combo: &ComboFacade, path: &str) -> Result<()> {
    let descriptor = combo
        .stat(path)
        .await
        .with_context(|| format!("Failed to stat {}", path))?;
    let mut stream = combo
        .read(&descriptor)
        .await
        .with_context(|| format!("Failed to open {}", path))?;

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.try_next().await? {
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Upload a local file.
async fn cmd_put(
    combo: &ComboFacade,
    source: &PathBuf,
    path: &str,
    mkdirs: bool,
    verify: bool,
) -> Result<()> {
    let (content, size) = source_stream(source)
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;

    let checksum = combo
        .write(path, content, mkdirs, verify)
        .await
        .with_context(|| format!("Failed to write {}", path))?;

    println!("Uploaded {} ({} bytes, md5 {})", path, size, checksum);
    Ok(())
}

/// Open a local file as a chunked upload body, with its size.
async fn source_stream(source: &Path) -> Result<(ByteStream, u64)> {
    let file = tokio::fs::File::open(source).await?;
    let size = file.metadata().await?.len();

    let label = source.display().to_string();
    let stream = ReaderStream::new(file).map(move |chunk| {
        chunk
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::from_io(label.as_str(), e))
    });
    Ok((Box::pin(stream), size))
}

/// Delete a file.
async fn cmd_rm(combo: &ComboFacade, path: &str) -> Result<()> {
    combo
        .delete(path)
        .await
        .with_context(|| format!("Failed to delete {}", path))?;
    println!("Deleted: {}", path);
    Ok(())
}

/// Print a stored file's checksum.
async fn cmd_checksum(combo: &ComboFacade, path: &str) -> Result<()> {
    let checksum = combo
        .compute_checksum(path)
        .await
        .with_context(|| format!("Failed to checksum {}", path))?;
    println!("{}  {}", checksum, path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_storage::{BackendKind, LocalConfig, ProviderConfig};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_source_is_streamed_in_chunks() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("big.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        std::fs::write(&source, &payload).unwrap();

        let (stream, size) = source_stream(&source).await.unwrap();
        assert_eq!(size, payload.len() as u64);

        let chunks: Vec<Vec<u8>> = stream.try_collect().await.unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn test_put_uploads_file() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("report.csv");
        std::fs::write(&source, b"a,b\n1,2\n").unwrap();

        let store = temp.path().join("store");
        let configs = vec![ProviderConfig::Local(LocalConfig::rooted("root", &store))];
        let combo = ComboFacade::from_configs(&FacadeFactory::with_defaults(), &configs).unwrap();

        cmd_put(&combo, &source, "root/in/report.csv", true, true)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(store.join("in").join("report.csv")).unwrap(),
            b"a,b\n1,2\n"
        );
    }

    #[test]
    fn test_factory_registers_smb_with_the_feature() {
        let factory = factory();
        assert!(factory.supports(BackendKind::Local));
        assert_eq!(factory.supports(BackendKind::Smb), cfg!(feature = "smb"));
    }

    #[tokio::test]
    async fn test_put_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let combo = ComboFacade::from_configs(&FacadeFactory::with_defaults(), &[]).unwrap();
        let missing = temp.path().join("missing.bin");
        assert!(cmd_put(&combo, &missing, "root/x.bin", false, false).await.is_err());
    }
}
