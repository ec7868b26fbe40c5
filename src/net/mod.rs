//! Transport abstraction.
//!
//! The framework only needs a duplex byte conduit that can deliver one
//! opaque packet at a time and accept one composed packet at a time; the
//! [`Net`] trait is that contract. Concrete transports (sockets, shared
//! memory, message buses) live outside the crate and feed inbound packets
//! through [`BaseNet::push_read_pack`].
//!
//! [`LoopbackNet`] wires two endpoints back to back in process, which is
//! all the integration tests need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

use crate::error::{Result, RpcError};

/// Default inbound queue depth.
pub const DEFAULT_READ_QUEUE: usize = 1024;

/// One inbound packet: the source peer identity plus the raw bytes of
/// `header ‖ payload`.
#[derive(Debug, Clone)]
pub struct NetPack {
    /// Source peer type.
    pub peer_type: u32,
    /// Source peer number.
    pub peer_no: u32,
    /// Header and payload, exactly as composed by the writer.
    pub payload: Bytes,
}

impl NetPack {
    /// Create an inbound packet.
    pub fn new(peer_type: u32, peer_no: u32, payload: Bytes) -> Self {
        Self {
            peer_type,
            peer_no,
            payload,
        }
    }
}

/// The minimal duplex transport primitive.
#[async_trait]
pub trait Net: Send + Sync {
    /// Record channel identity for logging and routing. Call once before
    /// the owning endpoint starts.
    fn set_mark(&self, mark: &str, is_server: bool, src_peer_type: u32, src_peer_no: u32);

    /// Pop the next inbound packet. Blocking, single consumer.
    ///
    /// # Errors
    ///
    /// [`RpcError::ReadChanClose`] once the transport has been closed.
    async fn read_rpc_pack(&self) -> Result<NetPack>;

    /// Enqueue one outbound packet composed by concatenating `frames` in
    /// order. Concurrent callers are permitted; the call may back-pressure.
    async fn write_rpc_pack(&self, dst_peer_type: u32, dst_peer_no: u32, frames: &[Bytes])
        -> Result<()>;

    /// Close the transport. Idempotent; pending and future reads fail, and
    /// writes observe an error thereafter.
    fn close(&self);
}

#[derive(Debug, Default, Clone)]
struct MarkInfo {
    mark: String,
    is_server: bool,
    src_peer_type: u32,
    src_peer_no: u32,
}

/// Bounded in-memory read queue shared by concrete transports.
///
/// Transport glue pushes decoded packets in with
/// [`BaseNet::push_read_pack`]; the owning endpoint pops them through the
/// [`Net`] read side. The base write side is a sink — concrete transports
/// supply their own.
pub struct BaseNet {
    info: StdMutex<MarkInfo>,
    closed: AtomicBool,
    close_notify: Notify,
    tx: mpsc::Sender<NetPack>,
    rx: AsyncMutex<mpsc::Receiver<NetPack>>,
}

impl BaseNet {
    /// Create a queue bounded at `max_read_queue` packets.
    pub fn new(max_read_queue: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_read_queue.max(1));
        Self {
            info: StdMutex::new(MarkInfo::default()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    /// Feed one inbound packet. Blocks when the queue is full.
    ///
    /// # Errors
    ///
    /// [`RpcError::NetClosed`] after [`Net::close`].
    pub async fn push_read_pack(&self, peer_type: u32, peer_no: u32, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::NetClosed);
        }

        self.tx
            .send(NetPack::new(peer_type, peer_no, payload))
            .await
            .map_err(|_| RpcError::NetClosed)
    }

    /// The channel mark recorded by `set_mark`.
    pub fn mark(&self) -> String {
        self.lock_info().mark.clone()
    }

    /// Whether this end was registered as the server side.
    pub fn is_server(&self) -> bool {
        self.lock_info().is_server
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_info(&self) -> std::sync::MutexGuard<'_, MarkInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Net for BaseNet {
    fn set_mark(&self, mark: &str, is_server: bool, src_peer_type: u32, src_peer_no: u32) {
        let mut info = self.lock_info();
        info.mark = mark.to_string();
        info.is_server = is_server;
        info.src_peer_type = src_peer_type;
        info.src_peer_no = src_peer_no;
    }

    async fn read_rpc_pack(&self) -> Result<NetPack> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a concurrent close cannot slip
        // between the check and the park.
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(RpcError::ReadChanClose);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            pack = rx.recv() => pack.ok_or(RpcError::ReadChanClose),
            _ = notified => Err(RpcError::ReadChanClose),
        }
    }

    async fn write_rpc_pack(
        &self,
        dst_peer_type: u32,
        dst_peer_no: u32,
        _frames: &[Bytes],
    ) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::NetClosed);
        }

        tracing::debug!(
            dst_peer_type,
            dst_peer_no,
            "BaseNet write is a sink; packet dropped"
        );
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }
}

/// Two [`BaseNet`] queues wired back to back: a write on one side surfaces
/// as an inbound packet on the other, stamped with the writer's identity.
pub struct LoopbackNet {
    base: BaseNet,
    own_peer_type: u32,
    own_peer_no: u32,
    peer: StdMutex<Option<Weak<LoopbackNet>>>,
}

impl LoopbackNet {
    /// Create a connected pair. Each side's `identity` is what the other
    /// side sees as the source of inbound packets.
    pub fn pair(
        capacity: usize,
        left_identity: (u32, u32),
        right_identity: (u32, u32),
    ) -> (Arc<LoopbackNet>, Arc<LoopbackNet>) {
        let left = Arc::new(LoopbackNet {
            base: BaseNet::new(capacity),
            own_peer_type: left_identity.0,
            own_peer_no: left_identity.1,
            peer: StdMutex::new(None),
        });
        let right = Arc::new(LoopbackNet {
            base: BaseNet::new(capacity),
            own_peer_type: right_identity.0,
            own_peer_no: right_identity.1,
            peer: StdMutex::new(None),
        });

        *left.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&right));
        *right.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&left));

        (left, right)
    }

    fn peer(&self) -> Option<Arc<LoopbackNet>> {
        self.peer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Net for LoopbackNet {
    fn set_mark(&self, mark: &str, is_server: bool, src_peer_type: u32, src_peer_no: u32) {
        self.base.set_mark(mark, is_server, src_peer_type, src_peer_no);
    }

    async fn read_rpc_pack(&self) -> Result<NetPack> {
        self.base.read_rpc_pack().await
    }

    async fn write_rpc_pack(
        &self,
        _dst_peer_type: u32,
        _dst_peer_no: u32,
        frames: &[Bytes],
    ) -> Result<()> {
        if self.base.is_closed() {
            return Err(RpcError::NetClosed);
        }

        let peer = self.peer().ok_or(RpcError::NetClosed)?;

        let total = frames.iter().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        for frame in frames {
            payload.extend_from_slice(frame);
        }

        peer.base
            .push_read_pack(self.own_peer_type, self.own_peer_no, payload.freeze())
            .await
    }

    fn close(&self) {
        self.base.close();
    }
}
