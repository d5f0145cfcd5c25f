//! Runs a few nodes in one process, each from its own thread:
//! every node puts its keys, waits for the others, gets its keys back,
//! waits again, then leaves the network.
//!
//! Run: `cargo run --example testnet -- --ids 1,3,5,7 --keys 1000`

use std::{
    net::SocketAddrV4,
    sync::{Arc, Barrier},
    thread,
    time::Instant,
};

use clap::Parser;
use kadht::{Dht, Id};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Node ids, the first node is the bootstrap node of all the others.
    #[arg(long, value_delimiter = ',', default_values_t = [1, 3, 5, 7])]
    ids: Vec<u64>,
    /// Port of the first node, the other nodes listen on the following ports.
    #[arg(long, default_value_t = 6900)]
    port: u16,
    /// Number of keys each node puts then gets.
    #[arg(long, default_value_t = 1000)]
    keys: u64,
    /// Bucket capacity.
    #[arg(long, default_value_t = kadht::DEFAULT_K)]
    k: usize,
    /// Print every node's routing table before leaving.
    #[arg(long)]
    dump: bool,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    if last_port(cli.port, cli.ids.len()).is_none() {
        eprintln!(
            "--port {} leaves no room for {} nodes, the last port would exceed 65535",
            cli.port,
            cli.ids.len()
        );
        std::process::exit(1);
    }

    let mut nodes: Vec<Dht> = Vec::with_capacity(cli.ids.len());
    let mut bootstrap = vec![];

    // Every port up to the last one fits in a u16.
    for (index, id) in cli.ids.iter().enumerate() {
        let address = SocketAddrV4::new([127, 0, 0, 1].into(), cli.port + index as u16);

        let node = Dht::builder()
            .id(Id(*id))
            .address(address)
            .k(cli.k)
            .bootstrap(&bootstrap)
            .build()
            .expect("failed to start node");

        if bootstrap.is_empty() {
            bootstrap.push(node.local_addr());
        }

        nodes.push(node);
    }

    let count = nodes.len() as u64;
    let barrier = Arc::new(Barrier::new(nodes.len()));

    let handles: Vec<_> = nodes
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, node)| {
            let barrier = barrier.clone();
            let keys = cli.keys;
            let dump = cli.dump;

            thread::spawn(move || {
                let keys: Vec<Id> = (0..keys).map(|i| Id(i * count + index as u64)).collect();

                let start = Instant::now();
                let mut failed_puts = 0;
                for key in &keys {
                    if node.put(*key, Id(key.0 + 1)).is_err() {
                        failed_puts += 1;
                    }
                }
                println!(
                    "node {}: put {} keys in {:?} ({failed_puts} failed)",
                    node.id(),
                    keys.len(),
                    start.elapsed()
                );

                barrier.wait();

                let start = Instant::now();
                let mut found = 0;
                for key in &keys {
                    if node.get(*key) == Some(Id(key.0 + 1)) {
                        found += 1;
                    }
                }
                println!(
                    "node {}: found {found}/{} keys in {:?}",
                    node.id(),
                    keys.len(),
                    start.elapsed()
                );

                barrier.wait();

                if dump {
                    println!("node {}\n{}", node.id(), node.routing_table());
                }

                let acks = node.leave();
                println!("node {}: left, {acks} nodes acknowledged", node.id());
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("node thread panicked");
    }

    for node in nodes {
        node.shutdown();
    }
}

/// Port of the last of `count` nodes listening on consecutive ports from `first`.
fn last_port(first: u16, count: usize) -> Option<u16> {
    u16::try_from(count.saturating_sub(1))
        .ok()
        .and_then(|offset| first.checked_add(offset))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consecutive_ports() {
        assert_eq!(last_port(6900, 4), Some(6903));
        assert_eq!(last_port(65_532, 4), Some(65_535));
        assert_eq!(last_port(65_533, 4), None);
        assert_eq!(last_port(1, 70_000), None);
    }
}
