//! IPC Server for handling UI client connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from UI
//! clients. Each connection carries request envelopes in one direction and
//! responses plus pushed output events in the other.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::{LineCodec, ProtocolError, RequestEnvelope, ServerMessage, LINE_DELIMITER};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directories cannot be created
    /// - The existing socket cannot be removed
    /// - The socket cannot be bound
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: RequestReader,
    writer: MessageWriter,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let codec = LineCodec::new();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: RequestReader {
                reader: BufReader::new(read_half),
                codec,
            },
            writer: MessageWriter {
                writer: write_half,
                codec,
            },
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<RequestEnvelope>, IpcError> {
        self.reader.read_request().await
    }

    /// Send a message to the client.
    pub async fn send(&mut self, message: &ServerMessage) -> Result<(), IpcError> {
        self.writer.send(message).await
    }

    /// Split into halves so reading and writing can run on separate tasks.
    pub fn into_split(self) -> (RequestReader, MessageWriter) {
        (self.reader, self.writer)
    }
}

/// Reading half of a connection.
pub struct RequestReader {
    reader: BufReader<OwnedReadHalf>,
    codec: LineCodec,
}

impl RequestReader {
    /// Read the next request, skipping blank lines.
    ///
    /// Returns `None` on disconnect. A line that does not decode yields
    /// [`IpcError::Malformed`]; the connection stays usable after it.
    pub async fn read_request(&mut self) -> Result<Option<RequestEnvelope>, IpcError> {
        loop {
            let Some(line) = read_line(&mut self.reader, self.codec.max_line_size()).await? else {
                return Ok(None);
            };

            match self.codec.decode(&line) {
                Ok(request) => return Ok(Some(request)),
                Err(ProtocolError::EmptyLine) => continue,
                Err(e) => return Err(IpcError::Malformed(e)),
            }
        }
    }
}

/// Writing half of a connection.
pub struct MessageWriter {
    writer: OwnedWriteHalf,
    codec: LineCodec,
}

impl MessageWriter {
    /// Encode and send one message.
    pub async fn send(&mut self, message: &ServerMessage) -> Result<(), IpcError> {
        let line = self.codec.encode(message)?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Reads one delimited line of at most `max` bytes.
///
/// Returns `None` on a clean EOF. A line longer than `max` is an error; the
/// stream cannot be resynchronised after it.
pub(crate) async fn read_line<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, IpcError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes_read = (&mut *reader)
        .take(max as u64)
        .read_until(LINE_DELIMITER, &mut line)
        .await?;

    if bytes_read == 0 {
        return Ok(None);
    }

    if line.last() != Some(&LINE_DELIMITER) && line.len() >= max {
        return Err(IpcError::Protocol(ProtocolError::LineTooLarge {
            size: line.len(),
            max,
        }));
    }

    Ok(Some(line))
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing or encoding failure; the connection is unusable afterwards.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A single line could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(ProtocolError),

    /// The peer closed the connection before answering.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The daemon answered with a response of the wrong kind.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}
