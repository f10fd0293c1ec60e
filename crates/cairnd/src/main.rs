//! cairnd — the cairn peer-to-peer feature-announcement daemon.

use std::io::Read;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cairn_core::node::{self, DEFAULT_PORT};
use cairn_core::packet::PacketMode;
use cairn_service::Params;

#[derive(Parser, Debug)]
#[command(
    name = "cairnd",
    version,
    about = "cairn peer-to-peer feature-announcement daemon",
    after_help = "The local IP address is guessed if not specified. The guess may be wrong.\n\n\
                  The --features specification is a JSON document like this: {\"feature1\":true,\"feature2\":10}\n\n\
                  The AWS credentials file should contain two fields of text: an access key id \
                  and a secret access key. The ambient AWS credential chain is used otherwise.\n\n\
                  The secret peer-to-peer messaging key is used with HMAC-SHA1."
)]
struct Args {
    /// Local IP address for peer-to-peer messaging (guessed if omitted)
    #[arg(long)]
    addr: Option<String>,

    /// UDP port for peer-to-peer messaging
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Static features as a JSON document
    #[arg(long)]
    features: Option<String>,

    /// Dynamic feature configuration directory
    #[arg(long, default_value = "/etc/cairn/features")]
    feature_dir: PathBuf,

    /// Runtime state root
    #[arg(long, default_value = "/run/cairn/state")]
    state_dir: PathBuf,

    /// Path for reading the peer-to-peer messaging key
    #[arg(long, conflicts_with = "secret_fd")]
    secret_file: Option<PathBuf>,

    /// File descriptor for reading the peer-to-peer messaging key
    #[arg(long)]
    secret_fd: Option<i32>,

    /// Path for reading AWS credentials
    #[arg(long, conflicts_with = "s3_cred_fd")]
    s3_cred_file: Option<PathBuf>,

    /// File descriptor for reading AWS credentials
    #[arg(long)]
    s3_cred_fd: Option<i32>,

    /// S3 region
    #[arg(long)]
    s3_region: String,

    /// S3 bucket
    #[arg(long)]
    s3_bucket: String,

    /// S3 key prefix
    #[arg(long, default_value = "")]
    s3_prefix: String,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let secret = read_file_or_fd(args.secret_file.as_deref(), args.secret_fd)
        .context("peer-to-peer secret")?
        .ok_or_else(|| anyhow!("either --secret-file or --secret-fd is required"))?;

    let addr = match args.addr {
        Some(addr) => addr,
        None => guess_addr().context("local address could not be guessed; pass --addr")?,
    };

    let credentials =
        read_file_or_fd(args.s3_cred_file.as_deref(), args.s3_cred_fd).context("AWS credentials")?;
    let client = make_s3_client(args.s3_region, credentials.as_deref()).await?;

    let params = Params {
        addr,
        port: args.port,
        features: args.features,
        feature_dir: args.feature_dir,
        state_dir: args.state_dir,
        send_mode: PacketMode::new(0, secret),
        receive_modes: None,
        s3_client: Some(client),
        s3_bucket: args.s3_bucket,
        s3_prefix: args.s3_prefix,
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    });

    cairn_service::serve(params, cancel).await?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let mut filter = EnvFilter::from_default_env();

    // RUST_LOG wins over the --debug flag.
    if std::env::var("RUST_LOG").is_err() {
        let level = if debug { "debug" } else { "info" };
        filter = filter.add_directive(level.parse().unwrap());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn read_file_or_fd(path: Option<&Path>, fd: Option<i32>) -> Result<Option<Vec<u8>>> {
    if let Some(fd) = fd {
        // Takes ownership of a descriptor inherited from the parent process.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .with_context(|| format!("file descriptor {fd}"))?;
        return Ok(Some(data));
    }

    if let Some(path) = path {
        let data = std::fs::read(path).with_context(|| path.display().to_string())?;
        return Ok(Some(data));
    }

    Ok(None)
}

/// Guess the local address by asking the OS which source address it would
/// route an outbound datagram from. UDP connect() sends nothing.
fn guess_addr() -> Result<String> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect(("198.51.100.1", DEFAULT_PORT))?;

    let ip = probe.local_addr()?.ip();
    if !node::is_global_unicast(&ip) {
        bail!("no usable local address (got {ip})");
    }

    Ok(ip.to_string())
}

async fn make_s3_client(region: String, credentials: Option<&[u8]>) -> Result<aws_sdk_s3::Client> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region));

    if let Some(data) = credentials {
        let text = std::str::from_utf8(data).context("AWS credentials are not UTF-8")?;
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 2 {
            bail!("bad AWS credentials format: expected an access key id and a secret access key");
        }
        loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
            fields[0],
            fields[1],
            None,
            None,
            "cairnd-credentials",
        ));
    }

    let config = loader.load().await;
    Ok(aws_sdk_s3::Client::new(&config))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}
