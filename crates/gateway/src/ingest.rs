//! Producer IPC ingest: the local stream socket and the framed-message
//! reader.
//!
//! Exactly one producer is served at a time; a second connection replaces
//! the first. Protocol errors terminate the offending connection while the
//! listener keeps accepting, so a restarted capture process can reconnect
//! immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use prism_protocol::wire::{self, MESSAGE_PREFIX_SIZE, MessageType, WireError, WireMessage};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::IngestSender;
use crate::stats::StreamStats;

/// Per-read deadline so shutdown is observed promptly even on an idle
/// socket. Expiry is not an error.
const READ_DEADLINE: Duration = Duration::from_secs(5);

/// Bind the producer socket and serve connections until cancelled.
/// Removes a stale socket file at startup and the live one on shutdown.
pub async fn run_ingest(
    socket_path: PathBuf,
    sender: IngestSender,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).with_context(|| {
            format!("failed to remove stale socket {}", socket_path.display())
        })?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind producer socket {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "Producer socket listening");

    let mut current: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Producer accept failed: {e}");
                        continue;
                    }
                };
                if let Some((prev_cancel, prev_task)) = current.take() {
                    warn!("Second producer connected, closing the previous connection");
                    prev_cancel.cancel();
                    let _ = prev_task.await;
                }
                stats.producer_connects.fetch_add(1, Ordering::Relaxed);
                info!("Producer connected");
                let conn_cancel = cancel.child_token();
                let task = tokio::spawn(read_producer(
                    stream,
                    sender.clone(),
                    conn_cancel.clone(),
                ));
                current = Some((conn_cancel, task));
            }
        }
    }

    if let Some((conn_cancel, task)) = current.take() {
        conn_cancel.cancel();
        let _ = task.await;
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        debug!("Could not remove socket file on shutdown: {e}");
    }
    info!("Producer listener stopped");
    Ok(())
}

/// Read framed messages off one producer connection until EOF, protocol
/// error, or cancellation. Never blocks on the downstream queue.
async fn read_producer(stream: UnixStream, sender: IngestSender, cancel: CancellationToken) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_message(&mut reader, &cancel).await {
            Ok(Some(message)) => publish(&sender, message),
            Ok(None) => {
                info!("Producer disconnected");
                return;
            }
            Err(ReadError::Cancelled) => {
                debug!("Producer reader cancelled");
                return;
            }
            Err(ReadError::Protocol(e)) => {
                warn!("Producer protocol error, closing connection: {e}");
                return;
            }
            Err(ReadError::Io(e)) => {
                warn!("Producer socket error: {e}");
                return;
            }
        }
    }
}

enum ReadError {
    Cancelled,
    Protocol(WireError),
    Io(std::io::Error),
}

enum ReadOutcome {
    Filled,
    Eof { read: usize },
    Cancelled,
}

/// Read one framed message. `Ok(None)` is a clean EOF at a message
/// boundary; EOF mid-message is a `Truncated` protocol error.
async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Option<WireMessage>, ReadError> {
    let mut prefix = [0u8; MESSAGE_PREFIX_SIZE];
    match read_full(reader, &mut prefix, cancel).await.map_err(ReadError::Io)? {
        ReadOutcome::Filled => {}
        ReadOutcome::Eof { read: 0 } => return Ok(None),
        ReadOutcome::Eof { read } => {
            return Err(ReadError::Protocol(WireError::Truncated {
                expected: MESSAGE_PREFIX_SIZE,
                got: read,
            }));
        }
        ReadOutcome::Cancelled => return Err(ReadError::Cancelled),
    }

    let msg_type = MessageType::from_byte(prefix[0]).map_err(ReadError::Protocol)?;
    let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
    wire::validate_length(len).map_err(ReadError::Protocol)?;

    let mut region = vec![0u8; len as usize];
    match read_full(reader, &mut region, cancel).await.map_err(ReadError::Io)? {
        ReadOutcome::Filled => {}
        ReadOutcome::Eof { read } => {
            return Err(ReadError::Protocol(WireError::Truncated {
                expected: len as usize,
                got: read,
            }));
        }
        ReadOutcome::Cancelled => return Err(ReadError::Cancelled),
    }

    WireMessage::decode(msg_type, &region)
        .map(Some)
        .map_err(ReadError::Protocol)
}

/// Fill `buf` completely, observing the read deadline and cancellation.
/// Deadline expiry just re-arms the read after checking for cancellation.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<ReadOutcome, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(ReadOutcome::Cancelled),
            result = tokio::time::timeout(READ_DEADLINE, reader.read(&mut buf[filled..])) => {
                match result {
                    Err(_elapsed) => continue,
                    Ok(Ok(0)) => return Ok(ReadOutcome::Eof { read: filled }),
                    Ok(Ok(n)) => filled += n,
                    Ok(Err(e)) => return Err(e),
                }
            }
        }
    }
    Ok(ReadOutcome::Filled)
}

/// Non-blocking handoff to the ingest queue; overflow is dropped and
/// counted inside the sender.
fn publish(sender: &IngestSender, message: WireMessage) {
    match message {
        WireMessage::Video { header, payload } => {
            sender.publish_video(header.into_sample(payload));
        }
        WireMessage::Audio { header, payload } => {
            sender.publish_audio(header.into_sample(payload));
        }
        WireMessage::Metadata(meta) => {
            info!(
                width = meta.video_width,
                height = meta.video_height,
                codec = %meta.video_codec,
                fps = meta.video_fps,
                "Stream metadata received"
            );
            sender.publish_metadata(meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{IngestItem, IngestReceiver, ingest_channel};
    use bytes::Bytes;
    use prism_protocol::wire::VideoHeader;
    use prism_protocol::{StreamMetadata, VideoCodec, VideoSample};
    use tokio::io::AsyncWriteExt;

    fn encoded_video(pts: i64, keyframe: bool, payload: &[u8]) -> Vec<u8> {
        WireMessage::Video {
            header: VideoHeader {
                pts,
                dts: pts,
                keyframe,
                width: 1920,
                height: 1080,
                codec: VideoCodec::H264,
            },
            payload: Bytes::copy_from_slice(payload),
        }
        .encode()
        .unwrap()
    }

    fn encoded_metadata() -> Vec<u8> {
        WireMessage::Metadata(StreamMetadata {
            video_width: 1920,
            video_height: 1080,
            video_codec: VideoCodec::H264,
            video_fps: 60,
            audio_sample_rate: 48_000,
            audio_channels: 2,
        })
        .encode()
        .unwrap()
    }

    async fn recv_video(rx: &mut IngestReceiver) -> VideoSample {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for sample")
                .expect("ingest queue closed");
            match item {
                IngestItem::Video(sample) => return sample,
                IngestItem::Metadata(_) => continue,
                other => panic!("expected video, got {other:?}"),
            }
        }
    }

    struct Fixture {
        socket: PathBuf,
        cancel: CancellationToken,
        task: JoinHandle<anyhow::Result<()>>,
        rx: IngestReceiver,
        stats: Arc<StreamStats>,
        _dir: tempfile::TempDir,
    }

    async fn start_ingest() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ingest.sock");
        let stats = Arc::new(StreamStats::default());
        let (tx, rx) = ingest_channel(128, 128, Arc::clone(&stats));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ingest(
            socket.clone(),
            tx,
            Arc::clone(&stats),
            cancel.clone(),
        ));
        for _ in 0..200 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(socket.exists(), "listener did not come up");
        Fixture {
            socket,
            cancel,
            task,
            rx,
            stats,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn frames_flow_from_socket_to_queue() {
        let mut f = start_ingest().await;

        let mut conn = UnixStream::connect(&f.socket).await.unwrap();
        let payload = [0u8, 0, 0, 1, 0x65, 0x88, 0x84];
        conn.write_all(&encoded_video(7, true, &payload)).await.unwrap();

        let sample = recv_video(&mut f.rx).await;
        assert_eq!(sample.pts, 7);
        assert!(sample.keyframe);
        assert_eq!(&sample.payload[..], &payload);

        f.cancel.cancel();
        f.task.await.unwrap().unwrap();
        assert!(!f.socket.exists(), "socket file must be removed on shutdown");
    }

    #[tokio::test]
    async fn producer_reconnect_delivers_all_frames() {
        let mut f = start_ingest().await;

        {
            let mut conn = UnixStream::connect(&f.socket).await.unwrap();
            conn.write_all(&encoded_metadata()).await.unwrap();
            for pts in 0..10 {
                conn.write_all(&encoded_video(pts, pts == 0, &[0x41])).await.unwrap();
            }
            conn.shutdown().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let mut conn = UnixStream::connect(&f.socket).await.unwrap();
            for pts in 10..20 {
                conn.write_all(&encoded_video(pts, pts == 10, &[0x41])).await.unwrap();
            }
            conn.shutdown().await.unwrap();
        }

        for expected in 0..20 {
            let sample = recv_video(&mut f.rx).await;
            assert_eq!(sample.pts, expected);
        }
        assert_eq!(f.stats.snapshot().producer_connects, 2);

        f.cancel.cancel();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_producer_replaces_first() {
        let mut f = start_ingest().await;

        let mut first = UnixStream::connect(&f.socket).await.unwrap();
        first.write_all(&encoded_video(1, true, &[0x65])).await.unwrap();
        assert_eq!(recv_video(&mut f.rx).await.pts, 1);

        let mut second = UnixStream::connect(&f.socket).await.unwrap();
        second.write_all(&encoded_video(2, true, &[0x65])).await.unwrap();
        assert_eq!(recv_video(&mut f.rx).await.pts, 2);

        // The replaced connection is closed by the gateway.
        let mut probe = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), first.read(&mut probe))
            .await
            .expect("first connection was not closed")
            .unwrap();
        assert_eq!(n, 0, "expected EOF on the replaced producer connection");

        assert_eq!(f.stats.snapshot().producer_connects, 2);
        f.cancel.cancel();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_message_closes_connection_not_listener() {
        let mut f = start_ingest().await;

        let mut bad = UnixStream::connect(&f.socket).await.unwrap();
        let mut prefix = vec![0x01u8];
        prefix.extend_from_slice(&(wire::MAX_MESSAGE_LEN + 1).to_be_bytes());
        bad.write_all(&prefix).await.unwrap();

        // The gateway closes its side after the protocol error.
        let mut probe = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), bad.read(&mut probe))
            .await
            .expect("connection was not closed after TooLarge")
            .unwrap();
        assert_eq!(n, 0);

        // A well-behaved producer can connect right away.
        let mut good = UnixStream::connect(&f.socket).await.unwrap();
        good.write_all(&encoded_video(3, false, &[0x41])).await.unwrap();
        assert_eq!(recv_video(&mut f.rx).await.pts, 3);

        f.cancel.cancel();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn truncated_message_is_discarded() {
        let mut f = start_ingest().await;

        let mut conn = UnixStream::connect(&f.socket).await.unwrap();
        let frame = encoded_video(9, true, &[0x65, 0x88, 0x84, 0x21]);
        conn.write_all(&frame[..frame.len() - 2]).await.unwrap();
        conn.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.rx.try_recv().is_none(), "truncated frame must not be published");

        // The listener survives; the next producer streams normally.
        let mut conn = UnixStream::connect(&f.socket).await.unwrap();
        conn.write_all(&encoded_video(10, true, &[0x65])).await.unwrap();
        assert_eq!(recv_video(&mut f.rx).await.pts, 10);

        f.cancel.cancel();
        f.task.await.unwrap().unwrap();
    }
}
