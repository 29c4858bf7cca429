use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use chrono::TimeDelta;
use tracing_subscriber::EnvFilter;

use keybucket_core::config::{Config, default_config_path};
use keybucket_core::{KeyBucket, KeyPair, ObjectStoreBucket, Publisher, RetrievalPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE to default so sshd closing the pipe early exits cleanly
    // instead of panicking with "broken pipe".
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "genkey" => cmd_genkey(&args[1..]).await,
        "authkeys" => cmd_authkeys(&args[1..]).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr: stdout belongs to sshd (`authkeys`) or the operator's
/// PEM (`genkey`).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_help() {
    println!(
        "\
keybucket - ephemeral SSH keys authorized through an object store

USAGE:
    keybucket <command> [options]

COMMANDS:
    genkey                    Generate a key, publish its public half, print the private key
    authkeys                  Print every currently valid public key (for AuthorizedKeysCommand)
    help                      Show this help

OPTIONS:
    -b, --bucket <name>       Bucket holding the keys            (env: KEYBUCKET_BUCKET)
    -r, --region <region>     Bucket region (required)           (env: KEYBUCKET_REGION)
    -c, --config <path>       Config file (default: ~/.config/keybucket/config.toml)
    --validity <hours>        Key lifetime for genkey (default: 6)

CREDENTIALS:
    The S3 client reads AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and friends
    from the environment.

SSHD:
    AuthorizedKeysCommand /usr/local/bin/keybucket authkeys --bucket my-keys --region us-west-2
    AuthorizedKeysCommandUser nobody

LOGGING:
    RUST_LOG=debug keybucket authkeys ...   (logs are written to stderr)"
    );
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    config: Option<PathBuf>,
    bucket: Option<String>,
    region: Option<String>,
    validity_hours: Option<u64>,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut opts = Options::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = || -> Result<String> {
            match inline.clone() {
                Some(v) => Ok(v),
                None => iter
                    .next()
                    .cloned()
                    .with_context(|| format!("{flag} requires a value")),
            }
        };

        match flag {
            "-c" | "--config" => opts.config = Some(PathBuf::from(value()?)),
            "-b" | "--bucket" => opts.bucket = Some(value()?),
            "-r" | "--region" => opts.region = Some(value()?),
            "--validity" => {
                let raw = value()?;
                let hours = raw
                    .parse()
                    .with_context(|| format!("--validity expects whole hours, got {raw:?}"))?;
                opts.validity_hours = Some(hours);
            }
            other => bail!("unknown option: {other}"),
        }
    }

    Ok(opts)
}

/// Config file, then `KEYBUCKET_*` environment, then flags.
fn load_config(opts: &Options) -> Result<Config> {
    let path = opts.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&path)?;
    config.apply_env();

    if let Some(bucket) = &opts.bucket {
        config.store.bucket = Some(bucket.clone());
    }
    if let Some(region) = &opts.region {
        config.store.region = Some(region.clone());
    }
    if let Some(hours) = opts.validity_hours {
        config.keys.validity_hours = hours;
    }
    tracing::debug!(path = %path.display(), ?config, "loaded config");
    Ok(config)
}

fn open_bucket(config: &Config) -> Result<Arc<dyn KeyBucket>> {
    Ok(Arc::new(ObjectStoreBucket::s3(&config.store)?))
}

async fn cmd_genkey(args: &[String]) -> Result<()> {
    let opts = parse_options(args)?;
    let config = load_config(&opts)?;
    let bucket = open_bucket(&config)?;
    let validity: TimeDelta = config.keys.validity();

    let key = tokio::task::spawn_blocking(move || KeyPair::generate(validity))
        .await
        .context("key generation task")?
        .context("generate key")?;

    let name = Publisher::new(bucket)
        .publish(&key)
        .await
        .context("publish key")?;
    tracing::info!(object = %name, expires = %key.expiration(), "key authorized");

    let pem = key.private_key_pem()?;
    let mut out = io::stdout().lock();
    out.write_all(pem.as_bytes())?;
    out.flush()?;
    Ok(())
}

async fn cmd_authkeys(args: &[String]) -> Result<()> {
    let opts = parse_options(args)?;
    let config = load_config(&opts)?;
    let bucket = open_bucket(&config)?;

    let pipeline = RetrievalPipeline::new(bucket, config.pipeline.clone());
    let mut keys = pipeline.list().await.context("list authorized keys")?;

    let mut out = io::BufWriter::new(io::stdout());
    while let Some(key) = keys.next_key().await {
        writeln!(out, "{key}")?;
    }
    out.flush()?;

    let stats = keys.stats();
    tracing::debug!(?stats, "authkeys finished");
    Ok(())
}
