//! Bidirectional byte relay between the two session endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

/// Read buffer size per relay direction.
const RELAY_BUF_SIZE: usize = 64 * 1024;

/// Copy bytes from `src` to `dst` until EOF, error, or abort.
///
/// On read EOF or read error the write side of `dst` is shut down so the
/// far peer observes EOF. On write error the loop stops and leaves `src`
/// alone; its half is released when the session drops both endpoints.
/// The abort flag is observed between iterations, and `wake` interrupts an
/// in-flight read. Returns the number of bytes copied.
pub async fn copy_until_shutdown<R, W>(
    src: &mut R,
    dst: &mut W,
    abort: &AtomicBool,
    wake: &Notify,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut copied = 0u64;

    loop {
        // Register for the wakeup before checking the flag: a close() that
        // lands between the two is then seen either by the check or by the
        // notification, never missed by both.
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if abort.load(Ordering::SeqCst) {
            let _ = dst.shutdown().await;
            return copied;
        }

        let n = tokio::select! {
            _ = &mut notified => {
                let _ = dst.shutdown().await;
                return copied;
            }
            res = src.read(&mut buf) => match res {
                Ok(0) | Err(_) => {
                    let _ = dst.shutdown().await;
                    return copied;
                }
                Ok(n) => n,
            }
        };

        if dst.write_all(&buf[..n]).await.is_err() {
            return copied;
        }
        copied += n as u64;
        trace!("[Relay] Forwarded {} bytes", n);
    }
}

/// Run both relay directions concurrently.
///
/// Completes only when both halves have finished, so each peer observes EOF
/// before the session tears the endpoints down. Returns
/// `(local_to_remote, remote_to_local)` byte counts.
pub async fn run_relay<A, B>(local: A, remote: B, abort: &AtomicBool, wake: &Notify) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::join!(
        copy_until_shutdown(&mut local_read, &mut remote_write, abort, wake),
        copy_until_shutdown(&mut remote_read, &mut local_write, abort, wake),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_mirrors_bytes_both_ways() {
        let (local_ours, mut local_theirs) = duplex(1024);
        let (remote_ours, mut remote_theirs) = duplex(1024);

        let relay = tokio::spawn(async move {
            let abort = AtomicBool::new(false);
            let wake = Notify::new();
            run_relay(local_ours, remote_ours, &abort, &wake).await
        });

        local_theirs.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_theirs.write_all(b"pong").await.unwrap();
        local_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing both far ends lets both halves run to completion.
        drop(local_theirs);
        drop(remote_theirs);
        let (up, down) = relay.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    #[tokio::test]
    async fn test_relay_stops_on_abort() {
        let (local_ours, local_theirs) = duplex(1024);
        let (remote_ours, remote_theirs) = duplex(1024);

        let abort = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let abort_clone = Arc::clone(&abort);
        let wake_clone = Arc::clone(&wake);

        let relay = tokio::spawn(async move {
            run_relay(local_ours, remote_ours, &abort_clone, &wake_clone).await
        });

        // Neither far peer sends anything; the relay only returns because
        // the abort is observed.
        abort.store(true, Ordering::SeqCst);
        wake.notify_waiters();

        let (up, down) = relay.await.unwrap();
        assert_eq!((up, down), (0, 0));

        drop(local_theirs);
        drop(remote_theirs);
    }
}
