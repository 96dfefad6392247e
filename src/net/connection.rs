// Line-framed connection
// Splits a plain or TLS stream into a line reader and a queued line writer

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::constants::{MAX_LINE_LENGTH, OUTBOUND_QUEUE_SIZE};
use crate::error::MessageError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A single connection carrying newline-delimited JSON frames
pub struct Connection {
    reader: LineReader,
    writer: LineWriter,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap any byte stream (TCP or TLS over TCP)
    pub fn new<S>(stream: S, peer_addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: BoxedReader = Box::new(read_half);
        let write_half: BoxedWriter = Box::new(write_half);

        Connection {
            reader: LineReader {
                inner: FramedRead::new(read_half, FrameCodec::new(MAX_LINE_LENGTH)),
            },
            writer: LineWriter {
                inner: BufWriter::new(write_half),
            },
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// One inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// Bytes that can't be a message (bad UTF-8, over-long line)
    Rejected(MessageError),
}

/// `LinesCodec` with content errors turned into frames.
///
/// Bad UTF-8 or an over-long line only rejects that line; the stream keeps
/// going. Only I/O failures end it.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        FrameCodec {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    fn frame(&self, result: Result<Option<String>, LinesCodecError>) -> io::Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Rejected(
                MessageError::TooLong {
                    max: self.max_length,
                },
            ))),
            // LinesCodec reports bad UTF-8 as InvalidData after consuming the line
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Frame::Rejected(MessageError::InvalidUtf8)))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        let result = self.inner.decode(src);
        self.frame(result)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        let result = self.inner.decode_eof(src);
        self.frame(result)
    }
}

/// Reading half: yields one frame per line.
///
/// `read_frame` is cancel safe, so it can be raced in `select!` without
/// losing data.
pub struct LineReader {
    inner: FramedRead<BoxedReader, FrameCodec>,
}

impl LineReader {
    /// Next non-blank frame; `None` once the peer closed the stream
    pub async fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        while let Some(frame) = self.inner.next().await {
            match frame? {
                Frame::Line(line) if line.trim().is_empty() => continue,
                frame => return Ok(Some(frame)),
            }
        }
        Ok(None)
    }
}

/// Writing half: one frame per call, flushed immediately
pub struct LineWriter {
    inner: BufWriter<BoxedWriter>,
}

impl LineWriter {
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Sender side of a connection's outbound queue
pub type Outbound = mpsc::Sender<String>;

/// Create an outbound queue and the task that drains it into `writer`.
///
/// The task ends when every sender is dropped or the socket write fails,
/// after which sends report the queue as closed.
pub fn spawn_writer(mut writer: LineWriter, label: String) -> (Outbound, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_SIZE);

    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_line(&line).await {
                debug!(connection = %label, error = %e, "Write failed, closing writer");
                break;
            }
        }
        rx.close();
        let _ = writer.shutdown().await;
        debug!(connection = %label, "Writer stopped");
    });

    (tx, handle)
}
