//! Connection I/O for both transports
//!
//! - **stream**: one JSON envelope per `\n`-terminated line
//! - **framed**: 4-byte little-endian length prefix, then the JSON envelope
//!
//! Each connection runs a reader task that forwards raw envelopes to the
//! network loop and a writer task draining a bounded channel of encoded
//! frames.

use super::message::MAX_MESSAGE_SIZE;
use super::network::InternalEvent;
use super::peer::{PeerId, TransportKind};
use super::NetworkError;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An encoded envelope shared across the writers of a broadcast
pub type Frame = Arc<[u8]>;

/// Read one length-prefixed frame; `None` on clean end of stream
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, NetworkError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one non-empty line; `None` on end of stream
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, NetworkError> {
    loop {
        let mut line = Vec::new();
        let read = (&mut *reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') && line.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::FrameTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if !line.is_empty() {
            return Ok(Some(line));
        }
    }
}

/// Write one `\n`-terminated line
pub(crate) async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Spawn the reader and writer tasks of a new connection
///
/// Returns the writer channel and the reader handle. Either task reports
/// `Closed` to the network loop when its half fails.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    peer: PeerId,
    transport: TransportKind,
    internal_tx: mpsc::Sender<InternalEvent>,
    buffer: usize,
) -> (mpsc::Sender<Frame>, JoinHandle<()>) {
    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(buffer.max(1));

    let reader_tx = internal_tx.clone();
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let reason = loop {
            let next = match transport {
                TransportKind::Stream => read_line(&mut reader).await,
                TransportKind::Framed => read_frame(&mut reader).await,
            };
            match next {
                Ok(Some(raw)) => {
                    if reader_tx.send(InternalEvent::Message { peer, raw }).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break "connection closed".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        let _ = reader_tx.send(InternalEvent::Closed { peer, reason }).await;
    });

    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let written = match transport {
                TransportKind::Stream => write_line(&mut write_half, &frame).await,
                TransportKind::Framed => write_frame(&mut write_half, &frame).await,
            };
            if let Err(e) = written {
                let _ = internal_tx
                    .send(InternalEvent::Closed {
                        peer,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    (frame_tx, reader)
}
