//! Tile-to-Tile Messaging Transport
//!
//! A bank of FIFO channels keyed by `(sender, receiver)` rank pairs. Ranks
//! `0..N-1` are tiles; rank `N` is the spawner coordinator. `send_w`
//! enqueues, `recv_w` blocks until a matching message arrives. Ordering is
//! FIFO per channel with no guarantees across channels. At teardown every
//! blocked receiver is released with a terminal status.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use log::debug;

pub type Rank = u32;

/// Outcome of a messaging call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Success,
    /// The transport has been torn down; no further traffic is possible
    Terminated,
    /// Sender or receiver rank outside `[0, N]`
    InvalidEndpoint,
}

struct Channel {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Channel { tx: Mutex::new(Some(tx)), rx: Mutex::new(rx) }
    }
}

/// The channel bank. One instance per simulator, shared by all tiles and
/// the spawner. The queues are unbounded, so `send_w` never blocks and
/// progress is guaranteed for every pair.
pub struct Transport {
    num_endpoints: usize,
    channels: Vec<Channel>,
}

impl Transport {
    /// `num_tiles` tiles plus the spawner rank `num_tiles`.
    pub fn new(num_tiles: usize) -> Self {
        let num_endpoints = num_tiles + 1;
        let channels = (0..num_endpoints * num_endpoints).map(|_| Channel::new()).collect();
        Transport { num_endpoints, channels }
    }

    pub fn num_endpoints(&self) -> usize {
        self.num_endpoints
    }

    /// Rank reserved for the spawner coordinator
    pub fn spawner_rank(&self) -> Rank {
        (self.num_endpoints - 1) as Rank
    }

    fn channel(&self, from: Rank, to: Rank) -> Option<&Channel> {
        let (from, to) = (from as usize, to as usize);
        if from >= self.num_endpoints || to >= self.num_endpoints {
            return None;
        }
        Some(&self.channels[from * self.num_endpoints + to])
    }

    /// Enqueue `payload` on the `(from, to)` channel.
    pub fn send_w(&self, from: Rank, to: Rank, payload: &[u8]) -> MsgStatus {
        let Some(channel) = self.channel(from, to) else {
            return MsgStatus::InvalidEndpoint;
        };
        let tx = channel.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) if tx.send(payload.to_vec()).is_ok() => MsgStatus::Success,
            _ => MsgStatus::Terminated,
        }
    }

    /// Block until a message arrives on `(from, to)` and copy up to
    /// `buf.len()` bytes into `buf`. Senders and receivers agree on sizes
    /// out-of-band; a mismatch truncates silently.
    pub fn recv_w(&self, from: Rank, to: Rank, buf: &mut [u8]) -> MsgStatus {
        let Some(channel) = self.channel(from, to) else {
            return MsgStatus::InvalidEndpoint;
        };
        let rx = channel.rx.lock().unwrap();
        match rx.recv() {
            Ok(message) => {
                let n = buf.len().min(message.len());
                buf[..n].copy_from_slice(&message[..n]);
                MsgStatus::Success
            }
            Err(_) => MsgStatus::Terminated,
        }
    }

    /// Drop every sender; blocked receivers observe `Terminated`.
    pub fn shutdown(&self) {
        for channel in &self.channels {
            channel.tx.lock().unwrap().take();
        }
        debug!("transport shut down ({} endpoints)", self.num_endpoints);
    }
}

/// A tile's (or the spawner's) view of the transport: its own rank plus the
/// shared channel bank.
#[derive(Clone)]
pub struct NetworkEndpoint {
    rank: Rank,
    transport: Arc<Transport>,
}

impl NetworkEndpoint {
    pub fn new(rank: Rank, transport: Arc<Transport>) -> Self {
        NetworkEndpoint { rank, transport }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn send_w(&self, to: Rank, payload: &[u8]) -> MsgStatus {
        self.transport.send_w(self.rank, to, payload)
    }

    pub fn recv_w(&self, from: Rank, buf: &mut [u8]) -> MsgStatus {
        self.transport.recv_w(from, self.rank, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_send_then_recv() {
        let transport = Transport::new(2);
        assert_eq!(transport.send_w(0, 1, b"hello"), MsgStatus::Success);
        let mut buf = [0u8; 5];
        assert_eq!(transport.recv_w(0, 1, &mut buf), MsgStatus::Success);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_fifo_per_channel() {
        let transport = Transport::new(2);
        for i in 0..8u8 {
            transport.send_w(0, 1, &[i]);
        }
        for i in 0..8u8 {
            let mut buf = [0u8; 1];
            assert_eq!(transport.recv_w(0, 1, &mut buf), MsgStatus::Success);
            assert_eq!(buf[0], i);
        }
    }

    #[test]
    fn test_channels_are_independent() {
        let transport = Transport::new(3);
        transport.send_w(0, 2, b"a");
        transport.send_w(1, 2, b"b");
        let mut buf = [0u8; 1];
        // draining (1, 2) does not consume (0, 2)'s message
        transport.recv_w(1, 2, &mut buf);
        assert_eq!(&buf, b"b");
        transport.recv_w(0, 2, &mut buf);
        assert_eq!(&buf, b"a");
    }

    #[test]
    fn test_blocking_recv_across_threads() {
        let transport = Arc::new(Transport::new(2));
        let receiver = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                let status = transport.recv_w(1, 0, &mut buf);
                (status, buf)
            })
        };
        transport.send_w(1, 0, &[1, 2, 3, 4]);
        let (status, buf) = receiver.join().unwrap();
        assert_eq!(status, MsgStatus::Success);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_shutdown_releases_blocked_receiver() {
        let transport = Arc::new(Transport::new(2));
        let receiver = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let mut buf = [0u8; 1];
                transport.recv_w(0, 1, &mut buf)
            })
        };
        // give the receiver a moment to block, then tear down
        thread::sleep(std::time::Duration::from_millis(20));
        transport.shutdown();
        assert_eq!(receiver.join().unwrap(), MsgStatus::Terminated);
    }

    #[test]
    fn test_invalid_endpoint() {
        let transport = Transport::new(2);
        assert_eq!(transport.send_w(0, 9, b"x"), MsgStatus::InvalidEndpoint);
        let mut buf = [0u8; 1];
        assert_eq!(transport.recv_w(9, 0, &mut buf), MsgStatus::InvalidEndpoint);
    }

    #[test]
    fn test_spawner_rank() {
        let transport = Transport::new(4);
        assert_eq!(transport.spawner_rank(), 4);
        assert_eq!(transport.send_w(4, 0, b"go"), MsgStatus::Success);
    }
}
