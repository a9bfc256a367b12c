//! Porcupine - expose local services through a hostname-routed relay

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use porcupine_auth::ClientIdentity;
use porcupine_client::{quic_connector, ClientConfig, ClientState, TunnelClient};
use porcupine_relay::{Relay, RelayConfig};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "porcupine")]
#[command(about = "Hostname-routed reverse tunnels", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "PORCUPINE_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    Relay(RelayArgs),

    /// Expose a local port under a public hostname
    #[command(group(ArgGroup::new("name").required(true).args(["hostname", "subdomain_of"])))]
    Connect(ConnectArgs),

    /// Generate a client key pair
    Keygen {
        /// Where to write the private key (`<path>.pub` gets the public line)
        #[arg(long, short, default_value = "./keys/id_porcupine")]
        output: PathBuf,

        /// Comment stored with the public key
        #[arg(long, default_value = "porcupine")]
        comment: String,

        /// Also append the public key to this authorized keys file
        #[arg(long)]
        authorize: Option<PathBuf>,

        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },
}

#[derive(Parser, Debug)]
struct RelayArgs {
    /// QUIC control endpoint for tunnel clients
    #[arg(long, default_value = "0.0.0.0:2222", env = "PORCUPINE_CONTROL_ADDR")]
    control_addr: SocketAddr,

    /// Public HTTP listener
    #[arg(long, default_value = "0.0.0.0:80", env = "PORCUPINE_HTTP_ADDR")]
    http_addr: SocketAddr,

    /// Public HTTPS listener; enables per-hostname certificates
    #[arg(long, env = "PORCUPINE_HTTPS_ADDR")]
    https_addr: Option<SocketAddr>,

    /// Contact email for the ACME account
    #[arg(long, env = "PORCUPINE_ACME_EMAIL")]
    acme_email: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[arg(long, env = "PORCUPINE_ACME_STAGING")]
    acme_staging: bool,

    /// Issued certificates and ACME account
    #[arg(long, default_value = "./certs", env = "PORCUPINE_CERT_DIR")]
    cert_dir: PathBuf,

    #[arg(long, default_value = "./keys/authorized_keys", env = "PORCUPINE_AUTHORIZED_KEYS")]
    authorized_keys: PathBuf,

    /// TLS certificate for the control endpoint (PEM); generated if omitted
    #[arg(long, env = "PORCUPINE_HOST_CERT", requires = "host_key")]
    host_cert: Option<PathBuf>,

    /// TLS private key for the control endpoint (PEM)
    #[arg(long, env = "PORCUPINE_HOST_KEY", requires = "host_cert")]
    host_key: Option<PathBuf>,

    /// Where a generated host identity is kept
    #[arg(long, default_value = "./keys", env = "PORCUPINE_DATA_DIR")]
    data_dir: PathBuf,

    /// Public name of this relay, added to a generated host certificate (repeatable)
    #[arg(long = "host-name")]
    host_names: Vec<String>,

    /// Issue self-signed certificates instead of using ACME (development)
    #[arg(long, env = "PORCUPINE_SELF_SIGNED")]
    self_signed: bool,
}

#[derive(Parser, Debug)]
struct ConnectArgs {
    /// Relay control address, host[:port]
    #[arg(long, default_value = "localhost:2222", env = "PORCUPINE_RELAY")]
    relay: String,

    /// Public hostname to bind
    #[arg(long)]
    hostname: Option<String>,

    /// Bind a random hostname under this domain
    #[arg(long)]
    subdomain_of: Option<String>,

    /// Local port to expose
    #[arg(long, short)]
    port: u16,

    #[arg(long, default_value = "localhost")]
    local_host: String,

    /// Client private key
    #[arg(long, default_value = "./keys/id_porcupine", env = "PORCUPINE_KEY")]
    key: PathBuf,

    #[arg(long, default_value = "5")]
    max_retries: usize,

    /// Delay between reconnection attempts in milliseconds
    #[arg(long, default_value = "5000")]
    retry_delay: u64,

    /// Trust this PEM certificate for the relay (self-signed relays)
    #[arg(long, env = "PORCUPINE_RELAY_CERT")]
    relay_cert: Option<PathBuf>,

    /// Skip relay certificate verification (insecure, development only)
    #[arg(long)]
    insecure: bool,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // quinn, tokio-rustls and instant-acme must agree on one provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Connect(args) => run_connect(args).await,
        Commands::Keygen {
            output,
            comment,
            authorize,
            force,
        } => keygen(&output, &comment, authorize.as_deref(), force),
    }
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let config = RelayConfig {
        control_addr: args.control_addr,
        http_addr: args.http_addr,
        https_addr: args.https_addr,
        acme_email: args.acme_email,
        acme_staging: args.acme_staging,
        cert_dir: args.cert_dir,
        authorized_keys: args.authorized_keys,
        host_cert: args.host_cert,
        host_key: args.host_key,
        data_dir: args.data_dir,
        host_names: args.host_names,
        self_signed: args.self_signed,
        ..Default::default()
    };

    let relay = Relay::bind(config).await.context("Failed to start relay")?;
    let shutdown = relay.shutdown_token();

    info!("Control: {} (QUIC)", relay.control_addr());
    info!("HTTP:    {}", relay.http_addr());
    if let Some(addr) = relay.https_addr() {
        info!("HTTPS:   {}", addr);
    }
    info!(
        "Clients can pin the relay certificate at {}",
        relay.host_identity().cert_path.display()
    );
    info!("Press Ctrl+C to stop");

    let relay_task = tokio::spawn(relay.run());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Error listening for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, stopping relay...");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }

    relay_task.await.context("Relay task panicked")??;
    Ok(())
}

async fn run_connect(args: ConnectArgs) -> Result<()> {
    let identity = ClientIdentity::load(&args.key)
        .with_context(|| format!("Failed to load client key {} (run `porcupine keygen`)", args.key.display()))?;

    let hostname = match (args.hostname, args.subdomain_of) {
        (Some(hostname), _) => hostname,
        (None, Some(base)) => porcupine_proto::random_subdomain(8, &base),
        (None, None) => bail!("either --hostname or --subdomain-of is required"),
    };

    let config = ClientConfig::builder()
        .relay_addr(args.relay)
        .hostname(hostname)
        .local_host(args.local_host)
        .local_port(args.port)
        .max_retries(args.max_retries)
        .retry_delay(Duration::from_millis(args.retry_delay))
        .relay_cert(args.relay_cert)
        .insecure(args.insecure)
        .build()?;

    info!(
        relay = %config.relay_addr,
        fingerprint = %identity.fingerprint(),
        "Connecting"
    );

    let connector = quic_connector(&config)?;
    let client = Arc::new(TunnelClient::new(config, identity, connector));

    let banner = tokio::spawn(print_banner(client.clone()));
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    tokio::pin!(runner);

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Error listening for shutdown signal: {}", e);
            }
            info!("Received Ctrl+C, disconnecting...");
            client.shutdown().await;
            (&mut runner).await
        }
        result = &mut runner => result,
    };
    banner.abort();

    result.context("Client task panicked")??;
    info!("Tunnel closed");
    Ok(())
}

/// Print the public URL on the first bind; later binds are reconnects
async fn print_banner<C>(client: Arc<TunnelClient<C>>)
where
    C: porcupine_transport::TransportConnector,
    C::Connection: 'static,
{
    let mut state = client.subscribe();
    let mut announced = false;

    loop {
        if let ClientState::Forwarding { hostname, .. } = state.borrow_and_update().clone() {
            if announced {
                info!(%hostname, "Tunnel re-established");
            } else {
                announced = true;
                let config = client.config();
                println!();
                println!("  Porcupine tunnel is up");
                println!();
                println!("  Public URL:  http://{}", hostname);
                println!("               https://{}", hostname);
                println!("  Forwarding:  {}", config.local_addr());
                println!("  Relay:       {}", config.relay_addr);
                println!();
            }
        }

        if state.changed().await.is_err() {
            return;
        }
    }
}

fn keygen(output: &Path, comment: &str, authorize: Option<&Path>, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    let identity = ClientIdentity::generate();
    let public_path = identity
        .save(output, comment)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    let line = identity.authorized_keys_line(comment);

    println!("Private key:  {}", output.display());
    println!("Public key:   {}", public_path.display());
    println!("Fingerprint:  {}", identity.fingerprint());

    if let Some(path) = authorize {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{}", line)?;
        println!("Authorized in {}", path.display());
    } else {
        println!();
        println!("Add this line to the relay's authorized keys:");
        println!("{}", line);
    }

    Ok(())
}
