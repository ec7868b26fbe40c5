//! In-memory framed packets and the caller-side wait primitive.
//!
//! A [`Pack`] is a decoded header plus an ordered sequence of opaque payload
//! frames. The transport sees a packet as the concatenation of the encoded
//! header and every frame; no length prefix separates frames, so the
//! receiver treats the whole tail as one application blob.
//!
//! A [`Request`] is a pack waiting for its response. The signalling half
//! lives in the pipeline's pending table; the caller keeps the
//! [`ResponseWaiter`] and parks on it until the read loop delivers the
//! response, the call times out, or the pipeline is stopped.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::header::PackHeader;
use crate::error::{Result, RpcError};

/// A header plus ordered payload frames.
#[derive(Debug, Clone)]
pub struct Pack {
    /// Decoded header.
    pub header: PackHeader,
    /// Payload frames, concatenated on the wire. May be empty.
    pub frames: Vec<Bytes>,
}

impl Pack {
    /// Create a pack with no payload frames.
    pub fn new(header: PackHeader) -> Self {
        Self {
            header,
            frames: Vec::new(),
        }
    }

    /// Create a pack carrying a single payload frame.
    pub fn single_frame(header: PackHeader, payload: Bytes) -> Self {
        let mut pack = Self::new(header);
        pack.add_frame(payload);
        pack
    }

    /// Append a payload frame.
    pub fn add_frame(&mut self, frame: Bytes) {
        self.frames.push(frame);
    }

    /// Encoded header followed by the payload frames, ready for
    /// `Net::write_rpc_pack`.
    pub fn to_wire(&self) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(1 + self.frames.len());
        parts.push(Bytes::from(self.header.encode()));
        parts.extend(self.frames.iter().cloned());
        parts
    }
}

/// Structurally a pack; the name marks the direction.
pub type Response = Pack;

/// A pending call: the sent pack plus the signalling half of a one-shot
/// channel. Lives in the pipeline's pending table until the caller removes
/// it.
#[derive(Debug)]
pub struct Request {
    /// The pack that was written out.
    pub pack: Pack,
    tx: Option<oneshot::Sender<(i32, Bytes)>>,
}

impl Request {
    /// Create a request and the waiter its caller will park on.
    pub fn new(header: PackHeader) -> (Self, ResponseWaiter) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                pack: Pack::new(header),
                tx: Some(tx),
            },
            ResponseWaiter { rx },
        )
    }

    /// Function number this call was issued under.
    #[inline]
    pub fn func_no(&self) -> u16 {
        self.pack.header.func_no
    }

    /// Deliver the response and wake the waiter. A second delivery, or a
    /// delivery after the waiter gave up, is a no-op.
    pub fn set_response(&mut self, code: i32, payload: Bytes) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send((code, payload));
        }
    }

    /// Drop the signalling half so the waiter observes a forced stop.
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

/// Caller-side half of a pending call. Single-shot: consumed by waiting.
#[derive(Debug)]
pub struct ResponseWaiter {
    rx: oneshot::Receiver<(i32, Bytes)>,
}

impl ResponseWaiter {
    /// Wait indefinitely for the response.
    ///
    /// # Errors
    ///
    /// [`RpcError::ForceCallStop`] if the request was cancelled.
    pub async fn wait(self) -> Result<(i32, Bytes)> {
        self.rx.await.map_err(|_| RpcError::ForceCallStop)
    }

    /// Wait with a wall-clock budget. `timeout_sec == 0` waits forever.
    ///
    /// # Errors
    ///
    /// [`RpcError::CallTimeout`] on expiry, [`RpcError::ForceCallStop`] if
    /// the request was cancelled.
    pub async fn wait_timeout(self, timeout_sec: u32) -> Result<(i32, Bytes)> {
        if timeout_sec == 0 {
            return self.wait().await;
        }

        match tokio::time::timeout(Duration::from_secs(u64::from(timeout_sec)), self.rx).await {
            Ok(result) => result.map_err(|_| RpcError::ForceCallStop),
            Err(_) => Err(RpcError::CallTimeout(timeout_sec)),
        }
    }
}

/// Body of the built-in function-list discovery response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFuncListResp {
    /// Exported function names mapped to their callee-assigned numbers.
    pub func_mapper: HashMap<String, u16>,
}
