//! Bidirectional byte bridge used once a CONNECT tunnel is established.
//!
//! Two copy loops run concurrently inside one task. The bridge ends as soon
//! as either loop finishes (EOF or error) or both directions have been idle
//! for the configured period; the remaining loop is dropped, which cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const COPY_BUFFER_BYTES: usize = 16 * 1024;

/// Which side of the bridge a copy loop reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first stream (`a`) to the second (`b`).
    AToB,
    /// From the second stream (`b`) to the first (`a`).
    BToA,
}

/// Why the bridge stopped.
#[derive(Debug)]
pub enum BridgeEnd {
    /// The source of this direction reached EOF.
    Eof(Direction),
    /// Reading or writing failed in this direction.
    Error(Direction, io::Error),
    /// No bytes moved in either direction for the idle period.
    Idle,
}

/// Result of a finished bridge.
#[derive(Debug)]
pub struct BridgeOutcome {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: BridgeEnd,
}

/// Shared byte counters and last-activity clock for both copy loops.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
            a_to_b: AtomicU64::new(0),
            b_to_a: AtomicU64::new(0),
        }
    }

    fn record(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Resolves once nothing has been recorded for `idle`.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let last = self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = last + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Propagate the half-close so the far peer sees EOF too.
            writer.shutdown().await.ok();
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.record(direction, n);
    }
}

/// Copy bytes between `a` and `b` in both directions until one side ends.
pub async fn bridge<A, B>(a: A, b: B, idle: Duration) -> BridgeOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);
    let activity = Activity::new();

    let end = tokio::select! {
        res = pump(&mut a_read, &mut b_write, Direction::AToB, &activity) => match res {
            Ok(()) => BridgeEnd::Eof(Direction::AToB),
            Err(e) => BridgeEnd::Error(Direction::AToB, e),
        },
        res = pump(&mut b_read, &mut a_write, Direction::BToA, &activity) => match res {
            Ok(()) => BridgeEnd::Eof(Direction::BToA),
            Err(e) => BridgeEnd::Error(Direction::BToA, e),
        },
        _ = activity.idle_for(idle) => BridgeEnd::Idle,
    };

    let outcome = BridgeOutcome {
        a_to_b: activity.a_to_b.load(Ordering::Relaxed),
        b_to_a: activity.b_to_a.load(Ordering::Relaxed),
        end,
    };
    tracing::trace!(
        a_to_b = outcome.a_to_b,
        b_to_a = outcome.b_to_a,
        end = ?outcome.end,
        "Bridge finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_flow_both_ways_until_eof() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let handle = tokio::spawn(bridge(a, b, Duration::from_secs(5)));

        a_peer.write_all(b"client hello").await.unwrap();
        let mut buf = [0u8; 12];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"client hello");

        b_peer.write_all(b"server hello").await.unwrap();
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"server hello");

        // Origin closes: the bridge ends and the client side sees EOF.
        drop(b_peer);
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome.end, BridgeEnd::Eof(Direction::BToA)));
        assert_eq!(outcome.a_to_b, 12);
        assert_eq!(outcome.b_to_a, 12);

        let mut rest = Vec::new();
        a_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tunnel_is_closed() {
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);

        let outcome = bridge(a, b, Duration::from_secs(30)).await;
        assert!(matches!(outcome.end, BridgeEnd::Idle));
        assert_eq!(outcome.a_to_b + outcome.b_to_a, 0);
    }
}
