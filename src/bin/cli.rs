// src/bin/cli.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Drive the mirroring proxy from the command line.
//!
//! Examples:
//! ```bash
//! s3mirror-cli create-bucket photos
//! s3mirror-cli ls     photos --prefix 2024/ --delimiter /
//! s3mirror-cli put    ./a.jpg photos 2024/a.jpg
//! s3mirror-cli get    photos 2024/a.jpg ./a-copy.jpg
//! s3mirror-cli get    photos 2024/a.jpg - --range 0-1023
//! s3mirror-cli rm     photos 2024/a.jpg
//! ```
//!
//! The remote endpoint and credentials come from the environment (or `.env`):
//! `S3MIRROR_ENDPOINT`, `AWS_REGION`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`.

use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use s3mirror::constants::DEFAULT_STREAM_CHUNK_SIZE;
use s3mirror::{
    Bucket, BucketKey, CompleteParams, CreateBucketParams, DataSink, DeleteOp, FileSystemStore,
    ListParams, MirrorConfig, MirrorError, MirrorStore, ObjKey, Object, ReadOp, Store, User,
    UserId, Writer, WriterParams,
};

/// Print to stdout, exiting quietly when the reader went away (e.g. `| head`)
macro_rules! safe_println {
    ($($arg:tt)*) => {
        match writeln!(io::stdout(), $($arg)*) {
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                std::process::exit(0);
            }
            Err(e) => return Err(e.into())
        }
    };
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(
        short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase log verbosity: -v = Info, -vv = Debug",
    )]
    verbose: u8,

    /// Root directory of the local store
    #[arg(long, default_value = ".s3mirror")]
    root: PathBuf,

    /// Acting user id
    #[arg(long, default_value = "admin")]
    user: String,

    /// Tenant of the acting user and its buckets
    #[arg(long, default_value = "")]
    tenant: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a bucket on the remote (the local record follows on first use)
    CreateBucket { bucket: String },

    /// List a bucket as the remote sees it
    Ls {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, default_value = "")]
        delimiter: String,
        #[arg(long, default_value_t = 0)]
        max_keys: usize,
        /// List the local store instead
        #[arg(long)]
        local: bool,
    },

    /// Upload a file to both sides
    Put { file: PathBuf, bucket: String, key: String },

    /// Download an object from the remote (`-` writes to stdout)
    Get {
        bucket: String,
        key: String,
        #[arg(default_value = "-")]
        dest: String,
        /// Inclusive byte range, e.g. 0-1023
        #[arg(long)]
        range: Option<String>,
    },

    /// Delete an object on both sides
    Rm { bucket: String, key: String },
}

/// Writes downloaded chunks to a file or stdout.
struct OutputSink(Box<dyn Write + Send>);

impl DataSink for OutputSink {
    fn handle_data(&mut self, data: &[u8], _ofs: u64) -> s3mirror::Result<()> {
        self.0.write_all(data).map_err(MirrorError::from)
    }
}

fn parse_range(spec: &str) -> Result<(u64, u64)> {
    let (start, end) = spec
        .split_once('-')
        .with_context(|| format!("range {spec:?} is not START-END"))?;
    let start: u64 = start.parse().with_context(|| format!("bad range start {start:?}"))?;
    let end: u64 = if end.is_empty() { u64::MAX } else { end.parse().with_context(|| format!("bad range end {end:?}"))? };
    if end < start {
        bail!("range end {end} is before start {start}");
    }
    Ok((start, end))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = MirrorConfig::from_env().context("invalid mirror configuration")?;
    let user_id = UserId::with_tenant(cli.tenant.clone(), cli.user.clone());

    let mut local = FileSystemStore::new(&cli.root);
    if let Some(creds) = config.credentials.clone() {
        local = local.with_user(user_id.clone(), creds);
    }
    let store = MirrorStore::new(Arc::new(local), config).context("failed to start mirror")?;
    store.initialize().await.context("failed to initialize local store")?;
    let user = store.get_user(&user_id);
    let bucket_key = |name: &str| BucketKey::with_tenant(cli.tenant.clone(), name);

    match cli.cmd {
        Command::CreateBucket { bucket } => {
            user.create_bucket(&CreateBucketParams::new(bucket_key(&bucket)))
                .await
                .with_context(|| format!("create bucket {bucket}"))?;
            safe_println!("created bucket '{}'", bucket);
        }

        Command::Ls { bucket, prefix, delimiter, max_keys, local } => {
            let params = ListParams { prefix, delimiter, marker: String::new(), max_keys };
            let handle = store.get_bucket(Some(user.as_ref()), &bucket_key(&bucket)).await?;
            let target = if local { handle.next_bucket().unwrap_or(handle.as_ref()) } else { handle.as_ref() };
            let results = target.list(&params).await.with_context(|| format!("list {bucket}"))?;
            for p in &results.common_prefixes {
                safe_println!("{:>12}  {}", "PRE", p);
            }
            for e in &results.objs {
                safe_println!("{:>12}  {}  {}  {}", e.size, e.last_modified, e.etag, e.key);
            }
            if results.is_truncated {
                info!("listing truncated, next marker {:?}", results.next_marker);
            }
        }

        Command::Put { file, bucket, key } => {
            let handle = store.get_bucket(Some(user.as_ref()), &bucket_key(&bucket)).await?;
            let obj = handle.get_object(&ObjKey::new(key.clone()));
            let params = WriterParams { owner: user_id.clone(), ..Default::default() };
            let mut writer = store.get_atomic_writer(obj, &params).await?;
            writer.prepare().await?;

            let mut input = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("open {}", file.display()))?;
            let mut buf = vec![0u8; DEFAULT_STREAM_CHUNK_SIZE];
            let mut offset = 0u64;
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.process(Bytes::copy_from_slice(&buf[..n]), offset).await?;
                offset += n as u64;
            }
            writer.process(Bytes::new(), offset).await?;
            writer
                .complete(CompleteParams { accounted_size: offset, ..Default::default() })
                .await
                .with_context(|| format!("upload {bucket}/{key}"))?;
            safe_println!("uploaded {} bytes to {}/{}", offset, bucket, key);
        }

        Command::Get { bucket, key, dest, range } => {
            let handle = store.get_bucket(Some(user.as_ref()), &bucket_key(&bucket)).await?;
            let obj = handle.get_object(&ObjKey::new(key.clone()));
            let mut op = obj.get_read_op();
            op.prepare().await.with_context(|| format!("stat {bucket}/{key}"))?;
            let (start, end) = match &range {
                Some(spec) => parse_range(spec)?,
                None => (0, op.size().saturating_sub(1)),
            };
            let out: Box<dyn Write + Send> = if dest == "-" {
                Box::new(io::stdout())
            } else {
                Box::new(std::fs::File::create(&dest).with_context(|| format!("create {dest}"))?)
            };
            let mut sink = OutputSink(out);
            op.iterate(start, end, &mut sink).await.with_context(|| format!("download {bucket}/{key}"))?;
            sink.0.flush()?;
        }

        Command::Rm { bucket, key } => {
            let handle = store.get_bucket(Some(user.as_ref()), &bucket_key(&bucket)).await?;
            let obj = handle.get_object(&ObjKey::new(key.clone()));
            obj.get_delete_op()
                .delete_obj()
                .await
                .with_context(|| format!("delete {bucket}/{key}"))?;
            safe_println!("deleted {}/{}", bucket, key);
        }
    }

    Ok(())
}
