// Wire format and socket plumbing for RFC 1350.
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)     | 01 | Filename | 0 | Mode | 0 |
// 2        Write req (WRQ)    | 02 | Filename | 0 | Mode | 0 |
// 3        Data (DATA)        | 03 | Block # (2 bytes) | Data (0-512 bytes) |
// 4        ACK                | 04 | Block # (2 bytes) |
// 5        ERROR              | 05 | ErrorCode (2 bytes) | ErrMsg | 0 |
//
// A DATA packet carrying fewer than 512 bytes marks the end of the transfer.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Size of a full DATA payload. Anything shorter is the final block.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest datagram read off a socket in one go. Larger than any legal
/// packet so oversized DATA payloads are seen and rejected instead of
/// silently truncated.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Why a datagram could not be decoded into a [`Packet`].
#[derive(Debug, PartialEq)]
pub enum PacketError {
    TooShort(usize),
    UnknownOpcode(u16),
    MissingTerminator(&'static str),
    InvalidText(&'static str),
    UnknownMode(String),
    InvalidLength { opcode: u16, len: usize },
    DataTooLarge(usize),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "packet too short: {len} bytes"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode: {op}"),
            Self::MissingTerminator(field) => write!(f, "{field} is not NUL-terminated"),
            Self::InvalidText(field) => write!(f, "{field} is not valid text"),
            Self::UnknownMode(mode) => write!(f, "unsupported transfer mode: '{mode}'"),
            Self::InvalidLength { opcode, len } => {
                write!(f, "invalid length {len} for opcode {opcode}")
            }
            Self::DataTooLarge(len) => write!(
                f,
                "data payload of {len} bytes exceeds the {DATA_BUFFER_SIZE} byte maximum"
            ),
        }
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// The message sent along with this code when the caller has nothing more specific to say.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::Illegal => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

/// Codes outside the RFC 1350 table, such as the RFC 2347 option refusal (8), read as `Undefined`.
impl From<u16> for ErrorCode {
    fn from(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq { path: String, mode: FileMode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string and the number of bytes consumed including the terminator, or `None` when
/// no terminator was found.
fn string_from_buffer(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((&buf[..end], end + 1))
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), PacketError> {
    let (raw_path, consumed) =
        string_from_buffer(buf).ok_or(PacketError::MissingTerminator("filename"))?;
    let (raw_mode, _) =
        string_from_buffer(&buf[consumed..]).ok_or(PacketError::MissingTerminator("mode"))?;

    let path = std::str::from_utf8(raw_path)
        .map_err(|_| PacketError::InvalidText("filename"))?
        .to_string();
    let raw_mode = std::str::from_utf8(raw_mode).map_err(|_| PacketError::InvalidText("mode"))?;

    // Anything after the mode terminator would be RFC 2347 options, which are not negotiated.
    let mode = match raw_mode.to_ascii_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        _ => return Err(PacketError::UnknownMode(raw_mode.to_string())),
    };

    Ok((path, mode))
}

impl Packet {
    /// Builds an error packet carrying the code's stock message.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().to_string() }
    }

    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::TooShort(buf.len()));
        }

        let opcode = u16_from_buffer(&buf[..2]);
        let body = &buf[2..];
        match opcode {
            OP_RRQ => {
                let (path, mode) = parse_path_and_mode(body)?;
                Ok(Packet::ReadReq { path, mode })
            }
            OP_WRQ => {
                let (path, mode) = parse_path_and_mode(body)?;
                Ok(Packet::WriteReq { path, mode })
            }
            OP_DATA => {
                let data = &body[2..];
                if data.len() > DATA_BUFFER_SIZE {
                    return Err(PacketError::DataTooLarge(data.len()));
                }
                Ok(Packet::Data { block: u16_from_buffer(body), data: data.to_vec() })
            }
            OP_ACK => {
                if buf.len() != 4 {
                    return Err(PacketError::InvalidLength { opcode, len: buf.len() });
                }
                Ok(Packet::Ack { block: u16_from_buffer(body) })
            }
            OP_ERROR => {
                let code = ErrorCode::from(u16_from_buffer(body));
                // Be lenient about a missing terminator, the message is informational only.
                let raw = match string_from_buffer(&body[2..]) {
                    Some((raw, _)) => raw,
                    None => &body[2..],
                };
                let message = String::from_utf8_lossy(raw).into_owned();
                Ok(Packet::Error { code, message })
            }
            _ => Err(PacketError::UnknownOpcode(opcode)),
        }
    }

    /// Encodes the packet into its canonical wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + DATA_BUFFER_SIZE);
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                let opcode = if matches!(self, Packet::ReadReq { .. }) { OP_RRQ } else { OP_WRQ };
                buf.extend_from_slice(&opcode.to_be_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&OP_DATA.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&OP_ACK.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&OP_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that speaks in TFTP packets on the way out and hands back raw
/// datagrams on the way in, so the caller decides what a malformed datagram means.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn recv(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_DATAGRAM_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..total_written].to_vec(), src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.serialize(), dst).await?;
        Ok(())
    }
}
