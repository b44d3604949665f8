//! The apply pipeline: a single serialized producer that delivers committed entries (or
//! snapshot-install notifications) to the upstream state machine in strict index order.

/// One fact delivered to the upstream state machine. Exactly one of the two shapes, never a
/// catch-all "maybe valid" flag: the channel delivers only successful facts, never errors.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command {
        command: Vec<u8>,
        index: u64,
        term: u64,
    },
    Snapshot {
        data: Vec<u8>,
        index: u64,
        term: u64,
    },
}

pub type ApplySender = tokio::sync::mpsc::Sender<ApplyMsg>;
pub type ApplyReceiver = tokio::sync::mpsc::Receiver<ApplyMsg>;

/// Create the apply channel used between a `Raft` replica and its upstream state machine.
///
/// The bound is generous but finite: a slow consumer exerts backpressure on the applier task
/// (which is allowed to block, see the concurrency model) rather than letting committed-but-
/// undelivered entries pile up in memory without limit.
pub fn channel(buffer: usize) -> (ApplySender, ApplyReceiver) {
    tokio::sync::mpsc::channel(buffer)
}
