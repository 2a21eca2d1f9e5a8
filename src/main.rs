//! S3 Bucket Manager command line
//!
//! ```bash
//! s3-bucket-manager -b media ls videos/ --suffix .mp4
//! s3-bucket-manager -b media get videos/intro.mp4 ./downloads/
//! s3-bucket-manager -b media get-prefix videos/ ./videos
//! s3-bucket-manager -b media put ./report.pdf reports/report.pdf
//! s3-bucket-manager -b media put-dir ./site www/
//! s3-bucket-manager -b media rm-prefix tmp/
//! s3-bucket-manager -b media cp reports/report.pdf s3://archive/2024/
//! s3-bucket-manager -b media presign uploads/photo.jpg --ttl 600
//! s3-bucket-manager config set bucket media
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use futures::TryStreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use s3_bucket_manager::s3::{
    BindOptions, BucketManager, ListingFilter, PresignOptions, S3Client, StorageClass, StorageLocator,
    TransferOptions,
};
use s3_bucket_manager::settings::Settings;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Bucket to operate on; defaults to the saved setting
    #[arg(short, long, global = true)]
    bucket: Option<String>,

    /// AWS profile name
    #[arg(long, global = true)]
    profile: Option<String>,

    #[arg(long, global = true)]
    region: Option<String>,

    /// Custom endpoint such as a MinIO server
    #[arg(long, global = true)]
    endpoint_url: Option<String>,

    /// Create the bucket if the account does not have it
    #[arg(long, global = true)]
    create_bucket: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List keys under a prefix
    #[command(name = "ls")]
    List {
        #[arg(default_value = "")]
        prefix: String,

        #[arg(short, long, default_value = "")]
        suffix: String,

        /// Wildcard pattern applied to the full key, e.g. '*.png'
        #[arg(short, long)]
        pattern: Option<String>,

        /// Skip folder marker keys
        #[arg(long)]
        no_folders: bool,
    },

    /// Download one object to a file or directory
    Get {
        key: String,

        #[arg(default_value = "")]
        dest: PathBuf,

        /// Create missing parent directories
        #[arg(short = 'p', long)]
        make_dirs: bool,
    },

    /// Download every object under a prefix into a directory
    GetPrefix {
        prefix: String,
        dir: PathBuf,

        #[arg(short, long, default_value = "")]
        suffix: String,
    },

    /// Upload one file
    Put {
        file: PathBuf,
        key: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Upload a directory tree under a key prefix
    PutDir {
        dir: PathBuf,

        #[arg(default_value = "")]
        prefix: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Delete one or more objects
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,

        /// Only report failures
        #[arg(short, long)]
        quiet: bool,
    },

    /// Delete every object under a prefix
    RmPrefix {
        prefix: String,

        #[arg(short, long)]
        quiet: bool,
    },

    /// Server-side copy to an s3:// URI
    Cp { key: String, uri: String },

    /// Copy every object into another bucket
    CpAll { dest_bucket: String },

    /// Print a presigned upload URL, or POST form fields with --post
    Presign {
        key: String,

        /// Lifetime in seconds; defaults to the saved setting
        #[arg(long)]
        ttl: Option<u64>,

        #[arg(long)]
        content_type: Option<String>,

        #[arg(long)]
        post: bool,
    },

    /// Print the AWS console link for a key
    ConsoleUrl { key: String },

    /// Show or change the saved settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the saved settings and where they live
    Show,

    /// Change one setting, e.g. `config set storage_class STANDARD_IA`
    Set {
        name: String,

        /// New value; an empty string clears optional settings
        value: String,
    },
}

#[derive(clap::Args)]
struct TransferArgs {
    #[arg(long)]
    storage_class: Option<StorageClass>,

    #[arg(long)]
    content_type: Option<String>,

    /// Object metadata as NAME=VALUE, repeatable
    #[arg(short, long = "metadata", value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,
}

impl TransferArgs {
    fn options(self, settings: &Settings) -> TransferOptions {
        let mut options = TransferOptions::with_storage_class(self.storage_class.unwrap_or(settings.storage_class));
        options.content_type = self.content_type;
        options.metadata = self.metadata.into_iter().collect();
        options
    }
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (name, value) = s
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got '{}'", s))?;
    Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    tracing::info!("Starting s3-bucket-manager v{}", env!("CARGO_PKG_VERSION"));

    let cmd = match cli.cmd {
        Command::Config { action } => return configure(action),
        cmd => cmd,
    };

    let mut settings = Settings::load()?;
    if cli.profile.is_some() {
        settings.profile = cli.profile;
    }
    if cli.region.is_some() {
        settings.region = cli.region;
    }
    if cli.endpoint_url.is_some() {
        settings.endpoint_url = cli.endpoint_url;
        settings.force_path_style = true;
    }

    let bucket = match cli.bucket.or_else(|| settings.bucket.clone()) {
        Some(bucket) => bucket,
        None => bail!("no bucket given; pass --bucket or set one in {:?}", Settings::settings_path()?),
    };

    let client = S3Client::with_config(settings.client_config())
        .await
        .context("Failed to create S3 client")?;
    let region = client.region().to_string();

    let manager = BucketManager::bind(
        Arc::new(client),
        BindOptions::new(&bucket)
            .create_if_missing(cli.create_bucket || settings.create_if_missing)
            .region(region),
    )
    .await
    .with_context(|| format!("Failed to open bucket '{}'", bucket))?;

    run(cmd, &manager, &settings).await
}

/// Settings commands run without contacting storage
fn configure(action: ConfigAction) -> Result<()> {
    let mut settings = Settings::load()?;

    match action {
        ConfigAction::Show => {
            eprintln!("# {}", Settings::settings_path()?.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigAction::Set { name, value } => {
            settings.set(&name, &value)?;
            settings.save()?;
            println!("{} = {:?}", name, value);
        }
    }

    Ok(())
}

async fn run(cmd: Command, manager: &BucketManager<S3Client>, settings: &Settings) -> Result<()> {
    match cmd {
        Command::List {
            prefix,
            suffix,
            pattern,
            no_folders,
        } => {
            let mut filter = ListingFilter::prefix(prefix).with_suffix(suffix);
            if no_folders {
                filter = filter.excluding_folders();
            }

            if pattern.is_some() {
                for key in manager.list(filter, pattern.as_deref()).await? {
                    println!("{}", key);
                }
            } else {
                let mut keys = Box::pin(manager.keys(filter));
                while let Some(key) = keys.try_next().await? {
                    println!("{}", key);
                }
            }
        }

        Command::Get { key, dest, make_dirs } => {
            let path = manager.download_object(&key, &dest, make_dirs).await?;
            println!("{}", path.display());
        }

        Command::GetPrefix { prefix, dir, suffix } => {
            for path in manager.download_prefix(&dir, &prefix, &suffix).await? {
                println!("{}", path.display());
            }
        }

        Command::Put { file, key, transfer } => {
            manager.upload_file(&file, &key, &transfer.options(settings)).await?;
            println!("{}", StorageLocator::new(manager.bucket(), key));
        }

        Command::PutDir { dir, prefix, transfer } => {
            for key in manager.upload_directory(&dir, &prefix, &transfer.options(settings)).await? {
                println!("{}", StorageLocator::new(manager.bucket(), key));
            }
        }

        Command::Rm { keys, quiet } => {
            if let [key] = keys.as_slice() {
                manager.delete_object(key).await?;
                if !quiet {
                    println!("deleted {}", key);
                }
            } else {
                report_deletes(manager.delete_objects(&keys, quiet).await?)?;
            }
        }

        Command::RmPrefix { prefix, quiet } => {
            report_deletes(manager.delete_by_prefix(&prefix, quiet).await?)?;
        }

        Command::Cp { key, uri } => {
            manager.copy_uri(&key, &uri).await?;
        }

        Command::CpAll { dest_bucket } => {
            let copied = manager.copy_all_to_bucket(&dest_bucket).await?;
            println!("copied {} objects to {}", copied.len(), dest_bucket);
        }

        Command::Presign {
            key,
            ttl,
            content_type,
            post,
        } => {
            let ttl = ttl.map(Duration::from_secs).unwrap_or_else(|| settings.presign_ttl());

            if post {
                let mut fields = BTreeMap::new();
                if let Some(content_type) = content_type {
                    fields.insert("Content-Type".to_string(), content_type);
                }
                let Some(post) = manager.generate_post_policy(&key, &fields, &[], ttl).await else {
                    bail!("Failed to presign POST policy for '{}'", key);
                };
                println!("{}", serde_json::to_string_pretty(&post)?);
            } else {
                let options = PresignOptions {
                    content_type,
                    ..Default::default()
                };
                let Some(url) = manager.generate_upload_url(&key, ttl, &options).await else {
                    bail!("Failed to presign upload for '{}'", key);
                };
                println!("{}", url);
            }
        }

        Command::ConsoleUrl { key } => {
            println!("{}", manager.console_url(&key));
        }

        Command::Config { action } => return configure(action),
    }

    Ok(())
}

fn report_deletes(result: s3_bucket_manager::s3::DeleteResult) -> Result<()> {
    for key in &result.deleted {
        println!("deleted {}", key);
    }
    for failure in &result.errors {
        eprintln!("failed {}: {} {}", failure.key, failure.code, failure.message);
    }
    result.into_result()?;
    Ok(())
}
