//! Command line front end for the bitcoin DNS seeder.

use bitcoin::Network;
use bitcoin_seeder::events::{log_events, EventSink, DEFAULT_EVENT_BUFFER};
use bitcoin_seeder::{default_port, Seeder, SeederBuilder};
use clap::Parser;
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Domain the DNS responder is authoritative for.
    #[arg(short, long)]
    domain: String,

    /// Bitcoin network to crawl (bitcoin, testnet, signet, regtest).
    #[arg(short, long, default_value = "bitcoin")]
    network: Network,

    /// UDP address to answer DNS queries on.
    #[arg(short, long, default_value = "0.0.0.0:53")]
    bind: SocketAddr,

    /// DNS seed used when there is nothing to crawl.
    #[arg(long, default_value = "seed.bitcoin.sipa.be")]
    seed: String,

    /// Port applied to addresses resolved from the seed, the network default if unset.
    #[arg(long)]
    seed_port: Option<u16>,

    /// Maximum number of concurrent crawls.
    #[arg(short, long, default_value = "8")]
    workers: usize,

    /// Registry snapshot file.
    #[arg(short, long, default_value = "peers.json")]
    snapshot: PathBuf,

    /// Keep the registry in memory only.
    #[arg(long)]
    no_snapshot: bool,

    /// Seconds between registry snapshots.
    #[arg(long, default_value = "300")]
    flush_interval: u64,

    /// Peer to crawl in addition to the seed, may be repeated.
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Peer never to crawl or serve, may be repeated.
    #[arg(long = "ban")]
    banned: Vec<SocketAddr>,

    /// Also ban peers that send malformed or out of order messages.
    #[arg(long)]
    ban_protocol_violators: bool,

    /// Custom user agent (optional).
    #[arg(short, long)]
    user_agent: Option<String>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    let mut builder = SeederBuilder::new(args.network)
        .with_dns_domain(&args.domain)?
        .with_dns_bind(args.bind)
        .with_max_concurrent_workers(args.workers)
        .with_manual_peers(args.peers)
        .with_banned_peers(args.banned)
        .with_ban_protocol_violators(args.ban_protocol_violators)
        .with_flush_interval(
            (args.flush_interval > 0).then(|| Duration::from_secs(args.flush_interval)),
        );
    let seed_port = args.seed_port.unwrap_or_else(|| default_port(args.network));
    builder = builder.with_seed(args.seed, seed_port);
    if args.no_snapshot {
        builder = builder.with_snapshot_path(None);
    } else {
        builder = builder.with_snapshot_path(Some(args.snapshot));
    }
    if let Some(user_agent) = args.user_agent {
        log::debug!("Using custom user agent: {user_agent}");
        builder = builder.with_user_agent(user_agent)?;
    }
    let config = builder.build()?;

    log::info!(
        "Seeding {} for {} on {}",
        config.dns.domain,
        config.network,
        config.dns.bind
    );

    let (events, events_rx) = EventSink::channel(DEFAULT_EVENT_BUFFER);
    let logger = tokio::spawn(log_events(events_rx));

    Seeder::new(config, events)
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // The drain ends once the last sink is dropped.
    let _ = tokio::time::timeout(Duration::from_secs(1), logger).await;
    Ok(())
}
