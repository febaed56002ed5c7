use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Lines,
};

/// Chunk size for file bodies on the transfer channel.
pub const BLOCK_SIZE: usize = 4096;

/// Ways a received frame can fail to decode.
///
/// All of these are client-caused: the dispatcher logs them and keeps the
/// connection alive rather than tearing anything down.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),
    #[error("'{opcode}' frame has {actual} fields, expected {expected}")]
    FieldCount {
        opcode: char,
        expected: usize,
        actual: usize,
    },
    #[error("unknown transfer mode '{0}'")]
    UnknownMode(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid length '{0}'")]
    InvalidLength(String),
}

/// How a requested file should travel between peers.
///
/// Only `Relay` (server-mediated) is implemented. `Direct` is parsed so the
/// wire shape stays extensible, but requests carrying it are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Relay,
    Direct,
}

impl TransferMode {
    fn parse(field: &str) -> Result<Self, FrameError> {
        match field {
            "relay" => Ok(TransferMode::Relay),
            "direct" => Ok(TransferMode::Direct),
            other => Err(FrameError::UnknownMode(other.to_string())),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Relay => "relay",
            TransferMode::Direct => "direct",
        }
    }
}

/// One message on the long-lived control channel.
///
/// Wire form is a newline-terminated line of colon-separated fields with the
/// opcode first. Fields carry no escaping, so payloads must not contain the
/// delimiter; a chat message with a colon decodes as a field-count error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// `i:<name>:<host>:<port>` - first frame on a connection, announcing the
    /// client's name and its transfer endpoint.
    Intro {
        name: String,
        host: String,
        port: u16,
    },
    /// `m:<sender>:<message>` - chat text for everyone but the sender.
    Chat { sender: String, message: String },
    /// `f:<sender>:<mode>:<owner>:<path>` - ask the server to move `owner`'s
    /// file at `path` to the sender.
    FileRequest {
        sender: String,
        mode: TransferMode,
        owner: String,
        path: String,
    },
    /// `x:<sender>` - leave the chat; the server echoes it back then closes.
    Exit { sender: String },
}

impl ControlFrame {
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let fields: Vec<&str> = line.split(':').collect();
        let opcode = *fields.first().ok_or(FrameError::Empty)?;
        match opcode {
            "" => Err(FrameError::Empty),
            "i" => {
                expect_fields('i', &fields, 4)?;
                Ok(ControlFrame::Intro {
                    name: fields[1].to_string(),
                    host: fields[2].to_string(),
                    port: parse_port(fields[3])?,
                })
            }
            "m" => {
                expect_fields('m', &fields, 3)?;
                Ok(ControlFrame::Chat {
                    sender: fields[1].to_string(),
                    message: fields[2].to_string(),
                })
            }
            "f" => {
                expect_fields('f', &fields, 5)?;
                Ok(ControlFrame::FileRequest {
                    sender: fields[1].to_string(),
                    mode: TransferMode::parse(fields[2])?,
                    owner: fields[3].to_string(),
                    path: fields[4].to_string(),
                })
            }
            "x" => {
                expect_fields('x', &fields, 2)?;
                Ok(ControlFrame::Exit {
                    sender: fields[1].to_string(),
                })
            }
            other => Err(FrameError::UnknownOpcode(other.to_string())),
        }
    }
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlFrame::Intro { name, host, port } => write!(f, "i:{name}:{host}:{port}"),
            ControlFrame::Chat { sender, message } => write!(f, "m:{sender}:{message}"),
            ControlFrame::FileRequest {
                sender,
                mode,
                owner,
                path,
            } => write!(f, "f:{sender}:{}:{owner}:{path}", mode.as_str()),
            ControlFrame::Exit { sender } => write!(f, "x:{sender}"),
        }
    }
}

/// The single command a transfer connection carries before its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCommand {
    /// `t:<path>` - send the file at `path` back on this connection.
    Transmit { path: String },
    /// `r:<path>` - a file is about to arrive on this connection.
    Receive { path: String },
}

impl TransferCommand {
    pub fn parse(header: &str) -> Result<Self, FrameError> {
        match header.split_once(':') {
            Some(("t", path)) => Ok(TransferCommand::Transmit {
                path: path.to_string(),
            }),
            Some(("r", path)) => Ok(TransferCommand::Receive {
                path: path.to_string(),
            }),
            Some((other, _)) => Err(FrameError::UnknownOpcode(other.to_string())),
            None if header.is_empty() => Err(FrameError::Empty),
            None => Err(FrameError::UnknownOpcode(header.to_string())),
        }
    }
}

impl fmt::Display for TransferCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferCommand::Transmit { path } => write!(f, "t:{path}"),
            TransferCommand::Receive { path } => write!(f, "r:{path}"),
        }
    }
}

/// The owner endpoint's verdict on a transfer, forwarded ahead of any body
/// byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// `l:<owner>:<path>:<length>` - file found; exactly `length` body bytes
    /// follow.
    Found {
        owner: String,
        path: String,
        length: u64,
    },
    /// `n:<owner>:<path>` - file missing or unreadable; no body follows.
    NotFound { owner: String, path: String },
}

impl TransferStatus {
    pub fn parse(header: &str) -> Result<Self, FrameError> {
        let fields: Vec<&str> = header.split(':').collect();
        let opcode = *fields.first().ok_or(FrameError::Empty)?;
        match opcode {
            "" => Err(FrameError::Empty),
            "l" => {
                expect_fields('l', &fields, 4)?;
                Ok(TransferStatus::Found {
                    owner: fields[1].to_string(),
                    path: fields[2].to_string(),
                    length: fields[3]
                        .parse()
                        .map_err(|_| FrameError::InvalidLength(fields[3].to_string()))?,
                })
            }
            "n" => {
                expect_fields('n', &fields, 3)?;
                Ok(TransferStatus::NotFound {
                    owner: fields[1].to_string(),
                    path: fields[2].to_string(),
                })
            }
            other => Err(FrameError::UnknownOpcode(other.to_string())),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Found {
                owner,
                path,
                length,
            } => write!(f, "l:{owner}:{path}:{length}"),
            TransferStatus::NotFound { owner, path } => write!(f, "n:{owner}:{path}"),
        }
    }
}

fn expect_fields(opcode: char, fields: &[&str], expected: usize) -> Result<(), FrameError> {
    if fields.len() != expected {
        return Err(FrameError::FieldCount {
            opcode,
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

fn parse_port(field: &str) -> Result<u16, FrameError> {
    field
        .parse()
        .map_err(|_| FrameError::InvalidPort(field.to_string()))
}

/// Source of control lines for one connection.
///
/// `next` is cancellation safe: a line whose bytes have only partially
/// arrived stays in the underlying buffer when the future is dropped, so a
/// `select!` loop can race it against other branches without losing the
/// consumed prefix. Decoding is left to the caller so a malformed line can
/// be logged without dropping the connection.
pub struct ControlLines<R> {
    lines: Lines<R>,
}

impl<R> ControlLines<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next non-empty line, without its terminator. Returns `Ok(None)` once
    /// the peer closes the connection.
    pub async fn next(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.is_empty() => continue,
                Some(line) => return Ok(Some(line)),
                None => return Ok(None),
            }
        }
    }
}

/// Writes a control frame as one line and flushes so peers see it promptly.
pub async fn write_control_frame<W>(writer: &mut W, frame: &ControlFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = frame.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed header from a transfer connection.
///
/// The prefix is a big-endian `u16` byte count followed by that many UTF-8
/// bytes.
pub async fn read_transfer_header<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut header = vec![0u8; len];
    reader.read_exact(&mut header).await?;
    String::from_utf8(header).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Writes one length-prefixed header and flushes it ahead of any body bytes.
pub async fn write_transfer_header<W>(writer: &mut W, header: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = header.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer header too long"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
