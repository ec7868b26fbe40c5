//! Wire format encoding and decoding.
//!
//! Every packet starts with a fixed-shape header:
//! ```text
//! ┌──────────┬───────────┬──────────┬───────────┐
//! │ Mark     │ Serial No │ Func No  │ Code      │
//! │ M bytes  │ 2 bytes   │ 2 bytes  │ 4 bytes   │
//! │ verbatim │ uint16 BE │ uint16 BE│ int32 BE  │
//! └──────────┴───────────┴──────────┴───────────┘
//! ```
//!
//! The mark is the per-channel byte tag; both ends of a channel must agree
//! on it, so the header length is `mark.len() + 8`. All multi-byte integers
//! are Big Endian.

use bytes::Bytes;

use crate::error::{Result, RpcError};

/// Bytes taken by the serial-number field.
pub const SERIAL_NO_LEN: usize = 2;

/// Bytes taken by the function-number field.
pub const FUNC_NO_LEN: usize = 2;

/// Bytes taken by the status-code field.
pub const CODE_LEN: usize = 4;

/// Header length past the mark (serial + func + code).
pub const FIXED_TAIL_LEN: usize = SERIAL_NO_LEN + FUNC_NO_LEN + CODE_LEN;

/// Response code: success.
pub const RES_CODE_SUCCESS: i32 = 0;

/// Response code: system error (dispatch miss, handler failure, marshal
/// failure). Applications may define additional codes >= 2.
pub const RES_CODE_SYS_ERR: i32 = 1;

/// Reserved function number for the function-list discovery call.
pub const FUNC_NO_FUNC_LIST: u16 = 1;

/// Reserved function name for the function-list discovery call.
pub const FUNC_NAME_FUNC_LIST: &str = "FetchFuncList";

/// Check that `buf` starts with the channel mark, byte for byte.
#[inline]
pub fn check_rpc_mark(mark: &[u8], buf: &[u8]) -> bool {
    buf.len() >= mark.len() && &buf[..mark.len()] == mark
}

/// Decoded packet header.
///
/// Requests carry `code == 0`; responses echo the request's serial and
/// function numbers and fill in the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackHeader {
    /// Per-channel byte tag; authenticates the start of a frame.
    pub mark: Bytes,
    /// Caller-allocated correlation number (0 on no-return sends).
    pub serial_no: u16,
    /// Callee-assigned numeric alias for a named procedure.
    pub func_no: u16,
    /// Status code on responses, 0 on requests.
    pub code: i32,
}

impl PackHeader {
    /// Create a request header (code 0).
    pub fn new(mark: impl Into<Bytes>, serial_no: u16, func_no: u16) -> Self {
        Self {
            mark: mark.into(),
            serial_no,
            func_no,
            code: RES_CODE_SUCCESS,
        }
    }

    /// Total encoded length: mark plus the fixed numeric tail.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.mark.len() + FIXED_TAIL_LEN
    }

    /// Encode the header to bytes (Big Endian).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.extend_from_slice(&self.mark);
        buf.extend_from_slice(&self.serial_no.to_be_bytes());
        buf.extend_from_slice(&self.func_no.to_be_bytes());
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Trailing bytes past the header are ignored; callers slice the
    /// payload off with [`PackHeader::header_len`].
    ///
    /// # Errors
    ///
    /// [`RpcError::MarkCheckFailed`] if `buf` does not start with `mark`,
    /// [`RpcError::HeaderTooSmall`] if the numeric tail is incomplete.
    pub fn decode(mark: &Bytes, buf: &[u8]) -> Result<Self> {
        if !check_rpc_mark(mark, buf) {
            return Err(RpcError::MarkCheckFailed);
        }

        let mark_len = mark.len();
        if buf.len() < mark_len + FIXED_TAIL_LEN {
            return Err(RpcError::HeaderTooSmall);
        }

        let tail = &buf[mark_len..];
        Ok(Self {
            mark: mark.clone(),
            serial_no: u16::from_be_bytes([tail[0], tail[1]]),
            func_no: u16::from_be_bytes([tail[2], tail[3]]),
            code: i32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]),
        })
    }
}
