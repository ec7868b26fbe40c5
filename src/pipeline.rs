//! Caller side: one pipeline per attached remote peer.
//!
//! A [`Pipeline`] owns the transport to one remote service, allocates
//! serial numbers, keeps the pending-call table, and runs the inbound read
//! loop that correlates responses back to their waiters.
//!
//! # Lifecycle
//!
//! ```ignore
//! let pipeline = Arc::new(Pipeline::new(net, peer_type, peer_no, "game"));
//! pipeline.set_interceptor(Arc::new(JsonInterceptor));
//! pipeline.set_timeout(5);
//! pipeline.start();
//! pipeline.fetch_func_list().await?;
//!
//! let mut out = Echo::default();
//! let code = pipeline.call("echo", &req, Some(&mut out)).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::interceptor::Interceptor;
use crate::net::Net;
use crate::proto::Proto;
use crate::protocol::{
    FetchFuncListResp, PackHeader, Request, FUNC_NAME_FUNC_LIST, FUNC_NO_FUNC_LIST,
    RES_CODE_SUCCESS, RES_CODE_SYS_ERR,
};
use crate::util::full_func_name;

struct CallTable {
    max_serial_no: u16,
    pending: HashMap<u16, Request>,
}

impl CallTable {
    fn new() -> Self {
        Self {
            max_serial_no: 0,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next serial number. Wraps modulo 2^16, skipping 0
    /// (reserved for no-return sends) and any serial still pending.
    fn allocate_serial(&mut self) -> Result<u16> {
        if self.pending.len() >= usize::from(u16::MAX) {
            return Err(RpcError::Config("pending-call table exhausted".into()));
        }

        loop {
            self.max_serial_no = self.max_serial_no.wrapping_add(1);
            let sno = self.max_serial_no;
            if sno != 0 && !self.pending.contains_key(&sno) {
                return Ok(sno);
            }
        }
    }
}

/// Caller-side view of one remote peer.
pub struct Pipeline {
    net: Arc<dyn Net>,
    service: String,
    mark: Bytes,
    peer_type: u32,
    peer_no: u32,
    func_names: RwLock<HashMap<String, u16>>,
    timeout_sec: AtomicU32,
    inter: RwLock<Option<Arc<dyn Interceptor>>>,
    calls: StdMutex<CallTable>,
}

impl Pipeline {
    /// Attach to the remote peer `(peer_type, peer_no)` behind `net`,
    /// talking the `service` channel.
    ///
    /// Until discovery runs, only the reserved `FetchFuncList` entry is
    /// known by name.
    pub fn new(net: Arc<dyn Net>, peer_type: u32, peer_no: u32, service: &str) -> Self {
        net.set_mark(service, false, peer_type, peer_no);

        let mut func_names = HashMap::new();
        func_names.insert(FUNC_NAME_FUNC_LIST.to_string(), FUNC_NO_FUNC_LIST);

        Self {
            net,
            service: service.to_string(),
            mark: Bytes::from(service.as_bytes().to_vec()),
            peer_type,
            peer_no,
            func_names: RwLock::new(func_names),
            timeout_sec: AtomicU32::new(0),
            inter: RwLock::new(None),
            calls: StdMutex::new(CallTable::new()),
        }
    }

    /// The service mark this pipeline talks.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Remote peer type.
    pub fn peer_type(&self) -> u32 {
        self.peer_type
    }

    /// Remote peer number.
    pub fn peer_no(&self) -> u32 {
        self.peer_no
    }

    /// Install the payload interceptor. Required before any typed call.
    pub fn set_interceptor(&self, inter: Arc<dyn Interceptor>) {
        *self.write_inter() = Some(inter);
    }

    /// Per-call wall-clock budget in seconds; 0 waits indefinitely.
    pub fn set_timeout(&self, timeout_sec: u32) {
        self.timeout_sec.store(timeout_sec, Ordering::Relaxed);
    }

    /// Function names currently known by name.
    pub fn func_list(&self) -> Vec<String> {
        self.read_funcs().keys().cloned().collect()
    }

    /// The most recently allocated serial number.
    pub fn last_serial_no(&self) -> u16 {
        self.lock_calls().max_serial_no
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.lock_calls().pending.len()
    }

    /// Spawn the inbound read loop. Call once, after construction.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.read_pack_loop().await })
    }

    /// Close the transport and cancel every pending call. Subsequent calls
    /// fail.
    pub fn stop(&self) {
        self.net.close();

        let mut table = self.lock_calls();
        for (_, mut req) in table.pending.drain() {
            req.cancel();
        }
    }

    /// Run discovery: call funcNo 1 and replace the local name map
    /// wholesale with the peer's exported list.
    pub async fn fetch_func_list(&self) -> Result<()> {
        let inter = self.interceptor().ok_or(RpcError::InterceptorNil)?;

        let (code, payload) = self.call_by_func_no(FUNC_NO_FUNC_LIST, &[]).await?;
        if code != RES_CODE_SUCCESS {
            return Err(RpcError::Remote {
                code,
                message: String::from_utf8_lossy(&payload).into_owned(),
            });
        }

        let mut resp = FetchFuncListResp::default();
        let full = full_func_name(&self.service, FUNC_NAME_FUNC_LIST);
        inter.on_unmarshal(&full, &payload, &mut resp)?;

        *self.write_funcs() = resp.func_mapper;
        Ok(())
    }

    /// Run discovery on a background task; `cb` receives the terminal
    /// error, or `None` on success.
    pub fn async_fetch_func_list<F>(self: &Arc<Self>, cb: F)
    where
        F: FnOnce(Option<RpcError>) + Send + 'static,
    {
        if self.interceptor().is_none() {
            cb(Some(RpcError::InterceptorNil));
            return;
        }

        let pipeline = self.clone();
        tokio::spawn(async move {
            cb(pipeline.fetch_func_list().await.err());
        });
    }

    /// Typed call: marshal `req_obj`, send, wait, unmarshal into
    /// `resp_obj`.
    ///
    /// A non-success code is not a transit error: the code is returned and
    /// `resp_obj` is left untouched (the payload carries the error text).
    pub async fn call(
        &self,
        func_name: &str,
        req_obj: &dyn Proto,
        resp_obj: Option<&mut dyn Proto>,
    ) -> Result<i32> {
        let inter = self.interceptor().ok_or(RpcError::InterceptorNil)?;

        let full = full_func_name(&self.service, func_name);
        let params = inter.on_marshal(&full, req_obj)?;

        let (code, payload) = self
            .call_by_func_name(func_name, &[Bytes::from(params)])
            .await?;

        if code == RES_CODE_SUCCESS {
            if let Some(obj) = resp_obj {
                inter.on_unmarshal(&full, &payload, obj)?;
            }
        }

        Ok(code)
    }

    /// Perform [`Pipeline::call`] on a background task and hand the result
    /// to `cb` as `(code, resp_obj, error)`.
    pub fn async_call<F>(
        self: &Arc<Self>,
        cb: F,
        func_name: &str,
        req_obj: Box<dyn Proto>,
        mut resp_obj: Box<dyn Proto>,
    ) where
        F: FnOnce(i32, Box<dyn Proto>, Option<RpcError>) + Send + 'static,
    {
        if self.interceptor().is_none() {
            cb(RES_CODE_SYS_ERR, resp_obj, Some(RpcError::InterceptorNil));
            return;
        }

        let pipeline = self.clone();
        let func_name = func_name.to_string();
        tokio::spawn(async move {
            match pipeline
                .call(&func_name, req_obj.as_ref(), Some(resp_obj.as_mut()))
                .await
            {
                Ok(code) => cb(code, resp_obj, None),
                Err(e) => cb(RES_CODE_SYS_ERR, resp_obj, Some(e)),
            }
        });
    }

    /// One-way notification: marshal and send under serial 0, enqueue
    /// nothing, never wait. The header is always sent, payload or not.
    pub async fn call_no_return(&self, func_name: &str, req_obj: &dyn Proto) -> Result<()> {
        let inter = self.interceptor().ok_or(RpcError::InterceptorNil)?;

        let full = full_func_name(&self.service, func_name);
        let params = inter.on_marshal(&full, req_obj)?;

        let func_no = self.resolve_func_no(func_name)?;

        let header = PackHeader::new(self.mark.clone(), 0, func_no);
        let mut wire = Vec::with_capacity(2);
        wire.push(Bytes::from(header.encode()));
        if !params.is_empty() {
            wire.push(Bytes::from(params));
        }

        self.net
            .write_rpc_pack(self.peer_type, self.peer_no, &wire)
            .await
    }

    /// Byte-level call by function name. Frames are sent as given; the
    /// returned payload is whatever the peer replied, with its status code.
    pub async fn call_by_func_name(
        &self,
        func_name: &str,
        frames: &[Bytes],
    ) -> Result<(i32, Bytes)> {
        let func_no = self.resolve_func_no(func_name)?;
        self.call_by_func_no(func_no, frames).await
    }

    /// Byte-level call by function number. Works before discovery.
    pub async fn call_by_func_no(&self, func_no: u16, frames: &[Bytes]) -> Result<(i32, Bytes)> {
        // Insert before writing, so the response can never race the table.
        let (serial_no, waiter, wire) = self.add_request(func_no, frames)?;

        if let Err(e) = self
            .net
            .write_rpc_pack(self.peer_type, self.peer_no, &wire)
            .await
        {
            self.remove_request(serial_no);
            return Err(e);
        }

        let timeout_sec = self.timeout_sec.load(Ordering::Relaxed);
        let result = waiter.wait_timeout(timeout_sec).await;

        // Exactly one removal per call, whatever the exit path. After a
        // forced stop the entry is already gone.
        self.remove_request(serial_no);

        result
    }

    fn add_request(
        &self,
        func_no: u16,
        frames: &[Bytes],
    ) -> Result<(u16, crate::protocol::ResponseWaiter, Vec<Bytes>)> {
        let mut table = self.lock_calls();

        let serial_no = table.allocate_serial()?;
        let header = PackHeader::new(self.mark.clone(), serial_no, func_no);

        let (mut req, waiter) = Request::new(header);
        for frame in frames {
            req.pack.add_frame(frame.clone());
        }
        let wire = req.pack.to_wire();

        table.pending.insert(serial_no, req);
        Ok((serial_no, waiter, wire))
    }

    fn remove_request(&self, serial_no: u16) {
        self.lock_calls().pending.remove(&serial_no);
    }

    fn resolve_func_no(&self, func_name: &str) -> Result<u16> {
        self.read_funcs()
            .get(func_name)
            .copied()
            .ok_or(RpcError::NotSupportFunc)
    }

    async fn read_pack_loop(&self) {
        loop {
            let pack = match self.net.read_rpc_pack().await {
                Ok(pack) => pack,
                Err(e) => {
                    tracing::debug!(service = %self.service, error = %e, "pipeline read loop ended");
                    break;
                }
            };

            let header = match PackHeader::decode(&self.mark, &pack.payload) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "dropping undecodable packet");
                    continue;
                }
            };

            let payload = pack.payload.slice(header.header_len()..);
            self.handle_pack(header.serial_no, header.func_no, header.code, payload);
        }
    }

    fn handle_pack(&self, serial_no: u16, func_no: u16, code: i32, payload: Bytes) {
        let mut table = self.lock_calls();

        let req = match table.pending.get_mut(&serial_no) {
            Some(req) => req,
            None => {
                tracing::warn!(serial_no, "dropping response with no pending call");
                return;
            }
        };

        if req.func_no() != func_no {
            tracing::warn!(
                serial_no,
                func_no,
                expected = req.func_no(),
                "dropping response with mismatched funcNo"
            );
            return;
        }

        req.set_response(code, payload);
    }

    fn interceptor(&self) -> Option<Arc<dyn Interceptor>> {
        self.inter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn write_inter(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn Interceptor>>> {
        self.inter.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_funcs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, u16>> {
        self.func_names.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_funcs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, u16>> {
        self.func_names.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}
