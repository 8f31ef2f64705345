//! BitGrid server: TCP front door for one cluster node.
//!
//! Usage:
//!   bitgrid-server [--data-dir <dir>] [--bind <addr>] [--peers <a,b,c>]
//!                  [--replication <n>] [--anti-entropy-secs <n>]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! Clients and anti-entropy peers speak the same protocol; `Digest` and
//! `Block` are the peer-facing commands. Ctrl-C drains the repair loop
//! and flushes every dirty fragment before exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use bitgrid::antientropy::{AntiEntropy, AntiEntropyOptions, TcpTransport};
use bitgrid::cluster::Node;
use bitgrid::stats::{AtomicStats, StatsSink};
use bitgrid::storage::FragmentKey;
use bitgrid::wire::{self, Request, Response};
use bitgrid::{Config, Engine};

fn print_usage() {
    println!("bitgrid-server {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Distributed bitmap-index server node");
    println!();
    println!("Usage: bitgrid-server [options]");
    println!();
    println!("Options:");
    println!("  --data-dir <dir>         Fragment storage root (default: ./bitgrid-data)");
    println!("  --bind <addr>            Listen address, also this node's identity");
    println!("                           (default: 127.0.0.1:10501)");
    println!("  --peers <a,b,c>          Comma-separated peer addresses");
    println!("  --replication <n>        Replicas per slice (default: 1)");
    println!("  --anti-entropy-secs <n>  Seconds between repair cycles (default: 60)");
    println!();
    println!("Flags:");
    println!("  -V, --version  Print version information");
    println!("  -h, --help     Print this help message");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn parse_config(args: &[String]) -> Config {
    let mut config = Config::default();
    if let Some(dir) = flag_value(args, "--data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(bind) = flag_value(args, "--bind") {
        config.bind = bind.to_string();
    }
    if let Some(n) = flag_value(args, "--replication") {
        match n.parse() {
            Ok(n) if n > 0 => config.replication = n,
            _ => {
                eprintln!("Error: --replication must be a positive integer, got '{n}'");
                std::process::exit(1);
            }
        }
    }
    if let Some(secs) = flag_value(args, "--anti-entropy-secs") {
        match secs.parse() {
            Ok(secs) => config.anti_entropy_interval = Duration::from_secs(secs),
            Err(_) => {
                eprintln!("Error: --anti-entropy-secs must be an integer, got '{secs}'");
                std::process::exit(1);
            }
        }
    }

    // Membership is self plus peers, deduplicated. Every node must be
    // given the same list for ownership views to agree.
    let mut members = vec![config.local_node()];
    if let Some(peers) = flag_value(args, "--peers") {
        for peer in peers.split(',').filter(|p| !p.is_empty()) {
            let node = Node::new(peer.trim());
            if !members.contains(&node) {
                members.push(node);
            }
        }
    }
    config.members = members;
    config
}

fn dispatch(engine: &Engine, stats: &AtomicStats, req: Request) -> Response {
    match req {
        Request::Write {
            index,
            frame,
            row,
            col,
            op,
        } => match engine.write(&index, &frame, row, col, op) {
            Ok(changed) => Response::Written { changed },
            Err(e) => Response::from_error(&e),
        },
        Request::Read { index, frame, row } => Response::Row {
            cols: engine.read(&index, &frame, row).iter_cols().collect(),
        },
        Request::Digest {
            index,
            frame,
            slice,
        } => {
            let key = FragmentKey::new(index, frame, slice);
            match engine.digest(&key) {
                Ok(digest) => Response::Digest { digest },
                Err(e) => Response::from_error(&e),
            }
        }
        Request::Block {
            index,
            frame,
            slice,
            row,
            block,
        } => {
            let key = FragmentKey::new(index, frame, slice);
            match engine.encoded_block(&key, row, block) {
                Ok(payload) => Response::Block { payload },
                Err(e) => Response::from_error(&e),
            }
        }
        Request::Status => Response::Status {
            node: engine.local().host.clone(),
            stats: stats.snapshot(),
        },
        Request::Ping => Response::Pong,
    }
}

async fn handle_client(mut stream: TcpStream, engine: Arc<Engine>, stats: Arc<AtomicStats>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    loop {
        let payload = match wire::read_frame(&mut stream).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                warn!(peer, error = %e, "read failed, dropping connection");
                break;
            }
        };

        let response = match wire::decode::<Request>(&payload) {
            Ok(request) => dispatch(&engine, &stats, request),
            Err(e) => Response::from_error(&e),
        };

        let bytes = match wire::encode(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(peer, error = %e, "response encode failed");
                break;
            }
        };
        if let Err(e) = wire::write_frame(&mut stream, &bytes).await {
            warn!(peer, error = %e, "write failed, dropping connection");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("bitgrid-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt::init();

    let config = parse_config(&args);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        bind = %config.bind,
        members = config.members.len(),
        replication = config.replication,
        "starting bitgrid-server"
    );

    let stats = Arc::new(AtomicStats::new());
    let engine = Engine::open(&config, stats.clone() as Arc<dyn StatsSink>)
        .with_context(|| format!("failed to open engine at {}", config.data_dir.display()))?;
    let engine = Arc::new(engine);
    info!(fragments = engine.catalog().keys().len(), "catalog loaded");

    let transport = Arc::new(TcpTransport::new(config.peer_timeout));
    let anti_entropy = Arc::new(AntiEntropy::new(
        engine.catalog().clone(),
        engine.topology().clone(),
        engine.local().clone(),
        transport,
        stats.clone() as Arc<dyn StatsSink>,
        AntiEntropyOptions {
            interval: config.anti_entropy_interval,
            concurrency: config.anti_entropy_concurrency,
            drain_timeout: config.drain_timeout,
        },
    ));
    let repair = anti_entropy.start();

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_client(stream, engine.clone(), stats.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    repair.stop().await;
    match engine.flush_all() {
        Ok(()) => info!("all fragments flushed"),
        Err(e) => error!(error = %e, "flush failed during shutdown"),
    }
    info!("exiting");
    Ok(())
}
