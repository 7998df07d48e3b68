//! Wire protocol
//!
//! All integers are big-endian.
//!
//! ```text
//! request:   [size:i32][request_id:i32][operation:u8][partition:i32][body]
//!            size = bytes after the size field = 9 + body.len()
//!
//! response:  [total:i32][request_id:i32][kind:u8][body]
//!            total = whole frame including the total field = 9 + body.len()
//! ```
//!
//! The two directions frame differently: the request size excludes its
//! own four bytes, the response total includes them. Clients depend on
//! both conventions, so neither is normalised here.

use std::io::{self, Read};

use crate::error::{DispatchError, ProtocolError};
use crate::partition::PartitionId;

/// Bytes in the size field that prefixes every frame.
pub const SIZE_PREFIX_LEN: usize = 4;
/// request_id (4) + operation (1) + partition (4).
pub const REQUEST_HEADER_LEN: usize = 9;
/// total (4) + request_id (4) + kind (1).
pub const RESPONSE_HEADER_LEN: usize = 9;
/// Port the data server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 7707;

/// Operation codes understood by the dispatch fabric.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read = 0,
    Write = 1,
}

impl TryFrom<u8> for Operation {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Operation::Read),
            1 => Ok(Operation::Write),
            other => Err(ProtocolError::UnsupportedOperation(other)),
        }
    }
}

/// Validate a request size prefix against the header size and a limit.
///
/// Returns the frame length (bytes following the size field).
pub fn check_frame_len(size: i32, max_frame_len: usize) -> Result<usize, ProtocolError> {
    if size < REQUEST_HEADER_LEN as i32 {
        return Err(ProtocolError::InvalidLength(size));
    }
    let len = size as usize;
    if len > max_frame_len {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }
    Ok(len)
}

/// Decoded client request.
///
/// The operation byte is kept raw: an unknown code is not a framing
/// error, it is answered with a failure response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: i32,
    pub op_code: u8,
    pub partition: PartitionId,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(
        request_id: i32,
        operation: Operation,
        partition: PartitionId,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_op_code(request_id, operation as u8, partition, body)
    }

    /// Build a request with an arbitrary operation byte.
    pub fn with_op_code(
        request_id: i32,
        op_code: u8,
        partition: PartitionId,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            request_id,
            op_code,
            partition,
            body: body.into(),
        }
    }

    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        Operation::try_from(self.op_code)
    }

    /// Value of the size prefix for this request.
    pub fn frame_len(&self) -> usize {
        REQUEST_HEADER_LEN + self.body.len()
    }

    /// Split a fixed header into (request_id, op_code, partition).
    pub fn parse_header(header: &[u8; REQUEST_HEADER_LEN]) -> (i32, u8, PartitionId) {
        let request_id = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let op_code = header[4];
        let partition = i32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        (request_id, op_code, PartitionId(partition))
    }

    /// Decode a frame (the bytes after the size prefix).
    pub fn decode_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < REQUEST_HEADER_LEN {
            return Err(ProtocolError::InvalidLength(frame.len() as i32));
        }
        let mut header = [0u8; REQUEST_HEADER_LEN];
        header.copy_from_slice(&frame[..REQUEST_HEADER_LEN]);
        let (request_id, op_code, partition) = Self::parse_header(&header);
        Ok(Self {
            request_id,
            op_code,
            partition,
            body: frame[REQUEST_HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(SIZE_PREFIX_LEN + self.frame_len());
        out.extend_from_slice(&(self.frame_len() as i32).to_be_bytes());
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.push(self.op_code);
        out.extend_from_slice(&self.partition.get().to_be_bytes());
        out.extend_from_slice(&self.body);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIZE_PREFIX_LEN + self.frame_len());
        self.encode_into(&mut out);
        out
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success = 0,
    Failure = 1,
}

impl TryFrom<u8> for ResponseKind {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ResponseKind::Success),
            1 => Ok(ResponseKind::Failure),
            _ => Err(ProtocolError::MalformedResponse("unknown response kind")),
        }
    }
}

/// Response to a single request, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: i32,
    pub kind: ResponseKind,
    pub body: Vec<u8>,
}

impl Response {
    pub fn success(request_id: i32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            kind: ResponseKind::Success,
            body: body.into(),
        }
    }

    /// Failure response carrying `<kind>: <message>`; with `verbose`
    /// the error's full source chain is appended.
    pub fn failure(request_id: i32, error: &DispatchError, verbose: bool) -> Self {
        Self {
            request_id,
            kind: ResponseKind::Failure,
            body: failure_text(error, verbose).into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResponseKind::Success
    }

    /// Self-inclusive total length of the encoded frame.
    pub fn total_len(&self) -> usize {
        RESPONSE_HEADER_LEN + self.body.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = self.total_len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as i32).to_be_bytes());
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode one response from the front of `bytes`.
    ///
    /// Returns `Ok(None)` if `bytes` does not yet hold a whole frame,
    /// otherwise the response and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if bytes.len() < SIZE_PREFIX_LEN {
            return Ok(None);
        }
        let total = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if total < RESPONSE_HEADER_LEN as i32 {
            return Err(ProtocolError::MalformedResponse("total shorter than header"));
        }
        let total = total as usize;
        if bytes.len() < total {
            return Ok(None);
        }
        let request_id = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let kind = ResponseKind::try_from(bytes[8])?;
        let body = bytes[RESPONSE_HEADER_LEN..total].to_vec();
        Ok(Some((
            Self {
                request_id,
                kind,
                body,
            },
            total,
        )))
    }

    /// Blocking read of one response (client side).
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut prefix = [0u8; SIZE_PREFIX_LEN];
        reader.read_exact(&mut prefix)?;
        let total = i32::from_be_bytes(prefix);
        if total < RESPONSE_HEADER_LEN as i32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::MalformedResponse("total shorter than header"),
            ));
        }
        let mut frame = vec![0u8; total as usize];
        frame[..SIZE_PREFIX_LEN].copy_from_slice(&prefix);
        reader.read_exact(&mut frame[SIZE_PREFIX_LEN..])?;
        match Self::decode(&frame) {
            Ok(Some((response, _))) => Ok(response),
            Ok(None) => Err(io::ErrorKind::UnexpectedEof.into()),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

fn failure_text(error: &DispatchError, verbose: bool) -> String {
    let mut text = format!("{}: {}", error.kind(), error);
    if verbose {
        let mut cause = std::error::Error::source(error);
        while let Some(err) = cause {
            text.push_str("\ncaused by: ");
            text.push_str(&err.to_string());
            cause = err.source();
        }
    }
    text
}
