//! Command-line client for the shard controller: join/leave/move groups, or query a
//! configuration generation.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shardraft::clerk::{Clerk, QueryClerk};

#[derive(Parser)]
#[command(version, about = "Talk to a replicated shard controller")]
struct Cli {
    /// `host:port` of every replica, in replica-index order.
    #[arg(long, value_delimiter = ',')]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register one or more groups, given as `gid=addr1;addr2`.
    Join {
        #[arg(required = true)]
        groups: Vec<String>,
    },
    /// Remove one or more groups by gid.
    Leave { gids: Vec<u64> },
    /// Reassign a single shard to a group.
    Move { shard: usize, gid: u64 },
    /// Print a configuration generation (`-1` for the latest).
    Query {
        #[arg(default_value_t = -1)]
        num: i64,
    },
}

fn parse_group(spec: &str) -> Result<(u64, Vec<String>)> {
    let (gid, addrs) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected gid=addr1;addr2, got {spec}"))?;
    let gid: u64 = gid.parse()?;
    let addrs = addrs.split(';').map(|s| s.to_string()).collect();
    Ok((gid, addrs))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.servers.is_empty() {
        bail!("--servers must list at least one replica address");
    }

    match cli.command {
        Commands::Join { groups } => {
            let mut parsed: BTreeMap<u64, Vec<String>> = BTreeMap::new();
            for spec in &groups {
                let (gid, addrs) = parse_group(spec)?;
                parsed.insert(gid, addrs);
            }
            let mut clerk = Clerk::new(cli.servers);
            clerk.join(parsed).await;
            println!("ok");
        }
        Commands::Leave { gids } => {
            let mut clerk = Clerk::new(cli.servers);
            clerk.leave(gids).await;
            println!("ok");
        }
        Commands::Move { shard, gid } => {
            let mut clerk = Clerk::new(cli.servers);
            clerk.move_shard(shard, gid).await;
            println!("ok");
        }
        Commands::Query { num } => {
            let clerk = QueryClerk::new(cli.servers);
            let config = clerk.query(num).await;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
