//! The per-connection subscriber pump: one cooperative loop that drains a
//! connection's queue and writes frames to its socket, PINGing on idle.
//!
//! Spec contract (spec.md §4.4): wait on the queue with a de-hopped jittered
//! timeout; a message arriving before the timeout is written as a frame, an
//! expired timeout sends an empty PING and loops again. Any write error
//! terminates the pump.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use tokio::sync::oneshot;

use crate::codec::{self, Opcode, CLOSE_FRAME, PING_FRAME};
use crate::dispatcher::Message;
use crate::Result;

/// `ping_interval - U(0, ping_interval / 2)`, de-herding PINGs across
/// connections that all subscribed around the same time.
fn jittered_timeout(ping_interval: Duration) -> Duration {
    let half_ms = (ping_interval.as_millis() / 2) as u64;
    let jitter_ms = if half_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half_ms)
    };
    ping_interval.saturating_sub(Duration::from_millis(jitter_ms))
}

/// Picks the frame to write for `message`: the precomputed compressed frame
/// if the peer negotiated the extension and one was built, otherwise a
/// freshly encoded uncompressed frame.
fn frame_for(message: &Message, compression_negotiated: bool) -> Vec<u8> {
    match (&message.compressed_frame, compression_negotiated) {
        (Some(frame), true) => frame.clone(),
        _ => codec::uncompressed_frame(Opcode::Text, &message.raw),
    }
}

/// Runs until the queue is closed (subscriber was unsubscribed), the shed
/// signal fires (quiesce is closing this connection), or a write fails.
/// `writer` is the write half of the connection's upgraded socket; the pump
/// owns it for its whole lifetime so it is also the one to write the CLOSE
/// frame a shed connection gets (spec.md §4.6 step 4).
pub async fn run<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Arc<Message>>,
    mut shed_rx: oneshot::Receiver<()>,
    ping_interval: Duration,
    compression_negotiated: bool,
) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    loop {
        let wait = jittered_timeout(ping_interval);
        tokio::select! {
            _ = &mut shed_rx => {
                let _ = writer.write_all(&CLOSE_FRAME).await;
                return Ok(());
            }
            received = tokio::time::timeout(wait, queue.recv()) => {
                match received {
                    Ok(Some(message)) => {
                        let frame = frame_for(&message, compression_negotiated);
                        writer.write_all(&frame).await?;
                    }
                    Ok(None) => return Ok(()),
                    Err(_elapsed) => {
                        writer.write_all(&PING_FRAME).await?;
                    }
                }
            }
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use std::time::Duration;

    fn message(raw: &[u8], codec: &FrameCodec) -> Arc<Message> {
        let compressed_frame = if raw.len() >= crate::dispatcher::MIN_COMPRESS_SIZE {
            Some(codec.compressed_frame(Opcode::Text, raw).unwrap())
        } else {
            None
        };
        Arc::new(Message {
            namespace: "/x".to_string(),
            raw: raw.to_vec(),
            compressed_frame,
        })
    }

    #[test]
    fn jitter_never_exceeds_the_configured_interval() {
        let interval = Duration::from_secs(20);
        for _ in 0..50 {
            let wait = jittered_timeout(interval);
            assert!(wait <= interval);
            assert!(wait >= Duration::from_secs(10));
        }
    }

    #[tokio::test]
    async fn pump_writes_ping_on_idle_then_frame_on_message() {
        let (tx, rx) = mpsc::channel(4);
        let (_shed_tx, shed_rx) = oneshot::channel();
        let (client, mut server) = tokio::io::duplex(4096);
        let codec = FrameCodec::new();

        let handle = tokio::spawn(run(client, rx, shed_rx, Duration::from_millis(20), false));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(message(b"hi", &codec)).await.unwrap();
        drop(tx);

        let mut buf = vec![0u8; 1024];
        use tokio::io::AsyncReadExt;
        let n = server.read(&mut buf).await.unwrap();
        // first bytes written should be at least one PING frame (0x89 0x00)
        assert_eq!(&buf[..2], &PING_FRAME);

        handle.await.unwrap().unwrap();
        let _ = n;
    }

    #[tokio::test]
    async fn shed_signal_writes_close_frame_and_returns() {
        let (_tx, rx) = mpsc::channel(4);
        let (shed_tx, shed_rx) = oneshot::channel();
        let (client, mut server) = tokio::io::duplex(4096);

        let handle = tokio::spawn(run(client, rx, shed_rx, Duration::from_secs(20), false));
        shed_tx.send(()).unwrap();

        let mut buf = [0u8; 2];
        use tokio::io::AsyncReadExt;
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, CLOSE_FRAME);

        handle.await.unwrap().unwrap();
    }
}
