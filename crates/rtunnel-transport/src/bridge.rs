//! Bidirectional byte copy between two duplex endpoints

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy bytes between `a` and `b` until either direction finishes.
///
/// Each direction copies until EOF and then half-closes its destination.
/// The first direction to finish (EOF or error) wins; the other is
/// cancelled and both endpoints are dropped.
pub async fn bridge<A, B>(a: A, b: B) -> io::Result<BridgeStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let result = tokio::select! {
        result = copy_half(&mut a_read, &mut b_write, &a_to_b) => {
            trace!("Bridge a->b finished first");
            result
        }
        result = copy_half(&mut b_read, &mut a_write, &b_to_a) => {
            trace!("Bridge b->a finished first");
            result
        }
    };

    let stats = BridgeStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    };
    result.map(|_| stats)
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    writer.shutdown().await
}
