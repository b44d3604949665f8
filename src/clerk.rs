//! Thin client for the shard controller: `Clerk` for writes (`join`/`leave`/`move_shard`), plus a
//! read-only `QueryClerk` for queries. The split mirrors the upstream `MakeClerk` /
//! `MakeQueryClerk` distinction: a `QueryClerk` never allocates a write sequence number and so
//! can be shared freely without coordinating with anyone holding a `Clerk`.
//!
//! Both clerks retry against the whole server list until one of them accepts the request,
//! remembering which server last worked so steady-state traffic doesn't re-probe the list on
//! every call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::shardctrl::{ClientReply, ClientRequest, Command, Config, Op, Reply};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

async fn send(server_addrs: &[String], last_server: &AtomicUsize, command: Command) -> Reply {
    let request = ClientRequest { command };
    let start = last_server.load(Ordering::Relaxed) % server_addrs.len().max(1);
    loop {
        for offset in 0..server_addrs.len() {
            let i = (start + offset) % server_addrs.len();
            match try_once(&server_addrs[i], &request).await {
                Some(reply) if reply.succeeded => {
                    last_server.store(i, Ordering::Relaxed);
                    return reply.reply.expect("succeeded replies always carry a Reply");
                }
                _ => continue,
            }
        }
        tokio::time::sleep(RETRY_BACKOFF).await;
    }
}

async fn try_once(addr: &str, request: &ClientRequest) -> Option<ClientReply> {
    let mut stream = TcpStream::connect(addr).await.ok()?;
    let bytes = serde_json::to_vec(request).ok()?;
    stream.write_u32(bytes.len() as u32).await.ok()?;
    stream.write_all(&bytes).await.ok()?;
    stream.flush().await.ok()?;

    let len = stream.read_u32().await.ok()?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

/// Random 62-bit id, used the way the upstream clerk uses `nrand()`: to give each clerk instance
/// a dedup identity distinct from every other clerk, without coordinating with a central
/// allocator.
fn random_clerk_id() -> u64 {
    rand::thread_rng().gen::<u64>() & ((1 << 62) - 1)
}

/// A write-capable client. Sequence numbers are issued from `&mut self`, so two tasks sharing a
/// `Clerk` would need to serialize their calls anyway; wrap in a `Mutex` if that's needed.
pub struct Clerk {
    server_addrs: Vec<String>,
    clerk_id: u64,
    seq_num: i64,
    last_server: AtomicUsize,
}

impl Clerk {
    pub fn new(server_addrs: Vec<String>) -> Self {
        Clerk {
            server_addrs,
            clerk_id: random_clerk_id(),
            seq_num: 0,
            last_server: AtomicUsize::new(0),
        }
    }

    async fn write(&mut self, op: Op) {
        self.seq_num += 1;
        let command = Command {
            clerk_id: self.clerk_id,
            seq_num: self.seq_num,
            op,
        };
        send(&self.server_addrs, &self.last_server, command).await;
    }

    pub async fn join(&mut self, groups: std::collections::BTreeMap<u64, Vec<String>>) {
        self.write(Op::Join { groups }).await;
    }

    pub async fn leave(&mut self, gids: Vec<u64>) {
        self.write(Op::Leave { gids }).await;
    }

    pub async fn move_shard(&mut self, shard: usize, gid: u64) {
        self.write(Op::Move { shard, gid }).await;
    }

    /// Queries don't need a dedicated `QueryClerk` to be safe to call from a `Clerk` too: the
    /// controller never dedups a `Query`.
    pub async fn query(&self, num: i64) -> Config {
        let command = Command {
            clerk_id: self.clerk_id,
            seq_num: -1,
            op: Op::Query { num },
        };
        match send(&self.server_addrs, &self.last_server, command).await {
            Reply::Config(config) => config,
            Reply::Ack => unreachable!("a Query is always answered with a Config"),
        }
    }
}

/// A read-only client. Carries its own `clerk_id` purely for wire-format uniformity; it is never
/// used for dedup since every request this clerk sends is a `Query`.
pub struct QueryClerk {
    server_addrs: Vec<String>,
    clerk_id: u64,
    last_server: AtomicUsize,
}

impl QueryClerk {
    pub fn new(server_addrs: Vec<String>) -> Self {
        QueryClerk {
            server_addrs,
            clerk_id: random_clerk_id(),
            last_server: AtomicUsize::new(0),
        }
    }

    pub async fn query(&self, num: i64) -> Config {
        let command = Command {
            clerk_id: self.clerk_id,
            seq_num: -1,
            op: Op::Query { num },
        };
        match send(&self.server_addrs, &self.last_server, command).await {
            Reply::Config(config) => config,
            Reply::Ack => unreachable!("a Query is always answered with a Config"),
        }
    }
}
