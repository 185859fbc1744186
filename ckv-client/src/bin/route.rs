//! ckv-route - print which servers own a set of keys
//!
//! Builds a virtual-node hash ring over the given servers and prints the
//! owners of each key, primary first. With `--ping`, each owner is also
//! contacted over RESP.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ckv_client::{ConnectionPool, ConsistentHashRouter, FactoryConfig, HashFunction, HashTopology, TcpConnector};
use ckv_common::ServerAddress;

struct Args {
    servers: Vec<ServerAddress>,
    keys: Vec<String>,
    vnodes: usize,
    owners: usize,
    version: u8,
    ping: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            servers: Vec::new(),
            keys: Vec::new(),
            vnodes: 64,
            owners: 1,
            version: HashFunction::DEFAULT_VERSION,
            ping: false,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--server" | "-s" => {
                    let value = iter.next().context("--server requires a value")?;
                    for part in value.split(',').filter(|p| !p.is_empty()) {
                        args.servers.push(part.parse()?);
                    }
                }
                "--vnodes" => {
                    args.vnodes = iter.next().context("--vnodes requires a value")?.parse()?;
                }
                "--owners" => {
                    args.owners = iter.next().context("--owners requires a value")?.parse()?;
                }
                "--hash-version" => {
                    args.version = iter.next().context("--hash-version requires a value")?.parse()?;
                }
                "--ping" => args.ping = true,
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => bail!("unknown argument: {}", flag),
                _ => args.keys.push(arg),
            }
        }

        if args.servers.is_empty() {
            bail!("at least one --server is required");
        }
        if args.keys.is_empty() {
            bail!("no keys given");
        }
        Ok(args)
    }
}

fn print_help() {
    println!(
        r#"
ckv-route - show key ownership on a ClusterKV ring

USAGE:
    ckv-route --server <HOST:PORT>[,<HOST:PORT>...] [OPTIONS] <KEY>...

OPTIONS:
    -s, --server <LIST>        Servers on the ring (repeatable, comma separated)
        --vnodes <N>           Virtual nodes per server (default: 64)
        --owners <N>           Owners per key (default: 1)
        --hash-version <V>     Hash function version, 1 or 2 (default: 2)
        --ping                 PING every owner
    -h, --help                 Print this help message

Set RUST_LOG=debug for routing logs.
"#
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse()?;
    let topology =
        HashTopology::with_virtual_nodes(&args.servers, args.vnodes, args.owners, args.version, u32::MAX)
            .context("building hash ring")?;
    info!(
        servers = topology.servers().len(),
        ring = topology.ring_len(),
        version = topology.hash_function_version(),
        "ring built"
    );

    // One pool per owner, opened on first ping.
    let config = FactoryConfig::default();
    let connector = Arc::new(TcpConnector);
    let mut pools: HashMap<ServerAddress, ConnectionPool> = HashMap::new();

    for key in &args.keys {
        let owners = ConsistentHashRouter::locate(key.as_bytes(), &topology);
        let position = ConsistentHashRouter::position(key.as_bytes(), &topology);
        let listed: Vec<String> = owners.iter().map(ToString::to_string).collect();
        println!("{}\t{}\t{}", key, position, listed.join(","));

        if args.ping {
            for owner in &owners {
                let pool = pools
                    .entry(owner.clone())
                    .or_insert_with(|| ConnectionPool::new(config.pool_config(owner.clone()), connector.clone()));
                println!("  {} {}", owner, ping(pool));
            }
        }
    }

    for pool in pools.values() {
        pool.drain();
    }
    Ok(())
}

fn ping(pool: &ConnectionPool) -> String {
    let mut lease = match pool.acquire() {
        Ok(lease) => lease,
        Err(err) => return format!("error: {}", err),
    };
    let reply = lease.exec(&[b"PING"]);
    drop(lease);
    match reply.and_then(|value| value.into_result()) {
        Ok(value) => format!("{:?}", value),
        Err(err) => format!("error: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn ping_reuses_one_pool_per_owner() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let owner = ServerAddress::from(listener.local_addr().expect("addr"));
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            for _ in 0..2 {
                // *1, $4, PING
                for _ in 0..3 {
                    line.clear();
                    reader.read_line(&mut line).expect("read");
                }
                stream.write_all(b"+PONG\r\n").expect("write");
            }
        });

        let pool = ConnectionPool::new(FactoryConfig::default().pool_config(owner), Arc::new(TcpConnector));
        assert_eq!(ping(&pool), "Simple([80, 79, 78, 71])");
        assert_eq!(ping(&pool), "Simple([80, 79, 78, 71])");
        assert_eq!(pool.stats().total, 1);

        pool.drain();
        server.join().expect("join");
    }
}
