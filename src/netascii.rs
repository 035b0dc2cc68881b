//! Netascii (RFC 764) line-ending translation.
//!
//! On the wire a newline is CR+LF and a lone carriage return is CR+NUL. Both functions are
//! stateless; callers streaming blocks are responsible for not splitting a CR from its successor.

use std::error;
use std::fmt;

const CR: u8 = 0x0d;
const LF: u8 = 0x0a;
const NUL: u8 = 0x00;

/// A CR on the wire was followed by something other than LF or NUL, or ended the stream.
#[derive(Debug, PartialEq)]
pub struct NetasciiError {
    pub offset: usize,
}

impl error::Error for NetasciiError {}

impl fmt::Display for NetasciiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bare carriage return at offset {} in netascii stream", self.offset)
    }
}

/// Translates local bytes into netascii.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &b in data {
        match b {
            LF => out.extend_from_slice(&[CR, LF]),
            CR => out.extend_from_slice(&[CR, NUL]),
            _ => out.push(b),
        }
    }
    out
}

/// Translates netascii back into local bytes.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, NetasciiError> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().enumerate();
    while let Some((offset, &b)) = bytes.next() {
        if b != CR {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some((_, &LF)) => out.push(LF),
            Some((_, &NUL)) => out.push(CR),
            _ => return Err(NetasciiError { offset }),
        }
    }
    Ok(out)
}
