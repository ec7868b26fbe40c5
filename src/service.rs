//! Callee side: a service hosting handlers under a mark.
//!
//! [`BaseService`] runs the read loop: decode the header, look up the
//! handler by function number, rebuild typed request/response objects
//! through the [`ServiceInterceptor`], invoke the handler, marshal the
//! response, and reply — echoing the request's serial and function numbers
//! with only the status code updated.
//!
//! Function number 1 is reserved: it is answered by the built-in
//! function-list responder so a freshly attached pipeline can discover the
//! name → number map over the same mechanism as every other call.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::interceptor::ServiceInterceptor;
use crate::net::Net;
use crate::proto::Body;
use crate::protocol::{
    FetchFuncListResp, PackHeader, FUNC_NAME_FUNC_LIST, FUNC_NO_FUNC_LIST, RES_CODE_SUCCESS,
    RES_CODE_SYS_ERR,
};
use crate::util::full_func_name;

/// A handler invoked for one inbound packet: `(request, response,
/// src_peer_type, src_peer_no)` to a status code.
///
/// With an interceptor the slots carry typed prototypes; without one the
/// request slot is the raw payload and the handler must leave bytes (or
/// nothing) in the response slot.
pub type RpcHandler =
    Arc<dyn Fn(&mut Body, &mut Body, u32, u32) -> Result<i32> + Send + Sync>;

/// The callee-side surface: naming, handler installation, lifecycle.
pub trait Service: Send + Sync {
    /// Assign the mark and bind it to the transport.
    fn set_name(&self, name: &str);

    /// The assigned mark.
    fn name(&self) -> String;

    /// The owned transport.
    fn rpc_net(&self) -> Arc<dyn Net>;

    /// When on, handler panics propagate and kill the read loop; when off
    /// they are caught and logged.
    fn set_debug_mode(&self, debug: bool);

    /// Install a handler under a function number. First write wins;
    /// function number 1 is reserved.
    fn add_processor(&self, handler: RpcHandler, func_no: u16, func_name: &str);

    /// Spawn the read loop.
    fn start(self: Arc<Self>) -> JoinHandle<()>;

    /// Close the transport; the read loop ends.
    fn stop(&self);
}

#[derive(Default)]
struct DispatchTables {
    no2name: HashMap<u16, String>,
    no2handler: HashMap<u16, RpcHandler>,
}

/// Standard [`Service`] implementation over any [`Net`].
pub struct BaseService {
    name: RwLock<String>,
    mark: RwLock<Bytes>,
    debug_mode: AtomicBool,
    tables: RwLock<DispatchTables>,
    inter: RwLock<Option<Arc<dyn ServiceInterceptor>>>,
    net: Arc<dyn Net>,
}

impl BaseService {
    /// Create a service over `net`. Call [`Service::set_name`] before
    /// starting.
    pub fn new(net: Arc<dyn Net>) -> Self {
        let mut tables = DispatchTables::default();
        tables
            .no2name
            .insert(FUNC_NO_FUNC_LIST, FUNC_NAME_FUNC_LIST.to_string());

        Self {
            name: RwLock::new(String::new()),
            mark: RwLock::new(Bytes::new()),
            debug_mode: AtomicBool::new(false),
            tables: RwLock::new(tables),
            inter: RwLock::new(None),
            net,
        }
    }

    /// Install the payload interceptor. Without one, handlers receive raw
    /// payload bytes.
    pub fn set_interceptor(&self, inter: Arc<dyn ServiceInterceptor>) {
        *self.inter.write().unwrap_or_else(|e| e.into_inner()) = Some(inter);
    }

    /// Whether debug mode is on.
    pub fn is_debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    /// The exported function list, built-in discovery entry included.
    pub fn func_list(&self) -> HashMap<String, u16> {
        self.read_tables()
            .no2name
            .iter()
            .map(|(no, name)| (name.clone(), *no))
            .collect()
    }

    async fn read_pack_loop(&self) {
        loop {
            let pack = match self.net.read_rpc_pack().await {
                Ok(pack) => pack,
                Err(e) => {
                    tracing::debug!(service = %self.name(), error = %e, "service read loop ended");
                    break;
                }
            };

            let mark = self.mark.read().unwrap_or_else(|e| e.into_inner()).clone();
            let header = match PackHeader::decode(&mark, &pack.payload) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(service = %self.name(), error = %e, "dropping undecodable packet");
                    continue;
                }
            };

            let payload = pack.payload.slice(header.header_len()..);

            let reply = if self.is_debug_mode() {
                Some(self.process(&header, &payload, pack.peer_type, pack.peer_no))
            } else {
                // Keep the loop alive when a handler panics.
                match catch_unwind(AssertUnwindSafe(|| {
                    self.process(&header, &payload, pack.peer_type, pack.peer_no)
                })) {
                    Ok(reply) => Some(reply),
                    Err(_) => {
                        tracing::error!(
                            service = %self.name(),
                            func_no = header.func_no,
                            "handler panicked; packet dropped"
                        );
                        None
                    }
                }
            };

            if let Some((code, payload)) = reply {
                self.write_response(&header, code, payload, pack.peer_type, pack.peer_no)
                    .await;
            }
        }
    }

    /// Run one dispatch cycle. Returns the status code and response
    /// payload; every outcome produces a reply.
    fn process(
        &self,
        header: &PackHeader,
        payload: &Bytes,
        src_peer_type: u32,
        src_peer_no: u32,
    ) -> (i32, Option<Vec<u8>>) {
        if header.func_no == FUNC_NO_FUNC_LIST {
            return match self.fetch_func_list_payload() {
                Ok(bytes) => (RES_CODE_SUCCESS, Some(bytes)),
                Err(e) => (RES_CODE_SYS_ERR, Some(e.to_string().into_bytes())),
            };
        }

        let (handler, func_name) = {
            let tables = self.read_tables();
            match tables.no2handler.get(&header.func_no) {
                Some(handler) => (
                    handler.clone(),
                    tables
                        .no2name
                        .get(&header.func_no)
                        .cloned()
                        .unwrap_or_default(),
                ),
                None => {
                    let reason = RpcError::NoHandler(header.func_no).to_string();
                    return (RES_CODE_SYS_ERR, Some(reason.into_bytes()));
                }
            }
        };

        let full = full_func_name(&self.name(), &func_name);
        let inter = self.interceptor();

        // Pre-handle: rebuild typed objects, or hand over the raw bytes.
        let (mut req_body, mut resp_body) = match &inter {
            Some(inter) => match inter.on_pre_handle(&full, payload) {
                Ok(bodies) => bodies,
                Err(e) => return (RES_CODE_SYS_ERR, Some(e.to_string().into_bytes())),
            },
            None => (Body::Bytes(payload.to_vec()), Body::Empty),
        };

        // Handle.
        let code = match handler(&mut req_body, &mut resp_body, src_peer_type, src_peer_no) {
            Ok(code) => code,
            Err(e) => return (RES_CODE_SYS_ERR, Some(e.to_string().into_bytes())),
        };

        // Post-handle: marshal the response and recycle the prototypes.
        let payload = match &inter {
            Some(inter) => match inter.on_handle_completion(&full, req_body, resp_body) {
                Ok(payload) => payload,
                Err(e) => return (RES_CODE_SYS_ERR, Some(e.to_string().into_bytes())),
            },
            None => match resp_body {
                Body::Bytes(bytes) => Some(bytes),
                Body::Empty => None,
                Body::Proto(_) => {
                    return (
                        RES_CODE_SYS_ERR,
                        Some(RpcError::WrongFormatRet.to_string().into_bytes()),
                    )
                }
            },
        };

        (code, payload)
    }

    fn fetch_func_list_payload(&self) -> Result<Vec<u8>> {
        let resp = FetchFuncListResp {
            func_mapper: self.func_list(),
        };

        match self.interceptor() {
            Some(inter) => {
                let full = full_func_name(&self.name(), FUNC_NAME_FUNC_LIST);
                let payload =
                    inter.on_handle_completion(&full, Body::Empty, Body::Proto(Box::new(resp)))?;
                Ok(payload.unwrap_or_default())
            }
            // Raw-bytes services still answer discovery; plain JSON is the
            // framework's own bootstrap encoding.
            None => Ok(serde_json::to_vec(&resp)?),
        }
    }

    async fn write_response(
        &self,
        req_header: &PackHeader,
        code: i32,
        payload: Option<Vec<u8>>,
        dst_peer_type: u32,
        dst_peer_no: u32,
    ) {
        let mut header = req_header.clone();
        header.code = code;

        let mut wire = Vec::with_capacity(2);
        wire.push(Bytes::from(header.encode()));
        if let Some(payload) = payload {
            wire.push(Bytes::from(payload));
        }

        if let Err(e) = self
            .net
            .write_rpc_pack(dst_peer_type, dst_peer_no, &wire)
            .await
        {
            tracing::warn!(service = %self.name(), error = %e, "failed to write response");
        }
    }

    fn interceptor(&self) -> Option<Arc<dyn ServiceInterceptor>> {
        self.inter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, DispatchTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Service for BaseService {
    fn set_name(&self, name: &str) {
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = name.to_string();
        *self.mark.write().unwrap_or_else(|e| e.into_inner()) =
            Bytes::from(name.as_bytes().to_vec());
        self.net.set_mark(name, true, 0, 0);
    }

    fn name(&self) -> String {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn rpc_net(&self) -> Arc<dyn Net> {
        self.net.clone()
    }

    fn set_debug_mode(&self, debug: bool) {
        self.debug_mode.store(debug, Ordering::Relaxed);
    }

    fn add_processor(&self, handler: RpcHandler, func_no: u16, func_name: &str) {
        if func_no == FUNC_NO_FUNC_LIST {
            tracing::warn!(func_name, "funcNo 1 is reserved for FetchFuncList; ignored");
            return;
        }

        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables.no2handler.contains_key(&func_no) {
            return;
        }

        tables.no2handler.insert(func_no, handler);
        tables.no2name.insert(func_no, func_name.to_string());
    }

    fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.read_pack_loop().await })
    }

    fn stop(&self) {
        self.net.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LoopbackNet;

    fn echo_handler() -> RpcHandler {
        Arc::new(|req, resp, _t, _n| {
            let bytes = req.as_bytes().unwrap_or_default().to_vec();
            *resp = Body::Bytes(bytes);
            Ok(RES_CODE_SUCCESS)
        })
    }

    fn service_pair() -> (Arc<BaseService>, Arc<LoopbackNet>) {
        let (cli_net, srv_net) = LoopbackNet::pair(16, (2, 1), (1, 1));
        let service = Arc::new(BaseService::new(srv_net));
        service.set_name("game");
        (service, cli_net)
    }

    async fn roundtrip(cli_net: &LoopbackNet, request: Vec<Bytes>) -> (PackHeader, Bytes) {
        cli_net.write_rpc_pack(1, 1, &request).await.unwrap();
        let pack = cli_net.read_rpc_pack().await.unwrap();
        let header = PackHeader::decode(&Bytes::from_static(b"game"), &pack.payload).unwrap();
        let payload = pack.payload.slice(header.header_len()..);
        (header, payload)
    }

    #[test]
    fn test_add_processor_first_write_wins() {
        let (service, _cli) = service_pair();

        service.add_processor(echo_handler(), 2, "echo");
        service.add_processor(
            Arc::new(|_req, _resp, _t, _n| Ok(99)),
            2,
            "echo-shadow",
        );

        let list = service.func_list();
        assert_eq!(list.get("echo"), Some(&2));
        assert!(!list.contains_key("echo-shadow"));
    }

    #[test]
    fn test_func_no_one_reserved() {
        let (service, _cli) = service_pair();
        service.add_processor(echo_handler(), FUNC_NO_FUNC_LIST, "imposter");

        assert_eq!(
            service.func_list().get(FUNC_NAME_FUNC_LIST),
            Some(&FUNC_NO_FUNC_LIST)
        );
        assert!(!service.func_list().contains_key("imposter"));
    }

    #[tokio::test]
    async fn test_raw_echo_roundtrip() {
        let (service, cli_net) = service_pair();
        service.add_processor(echo_handler(), 2, "echo");
        service.clone().start();

        let req_header = PackHeader::new(Bytes::from_static(b"game"), 7, 2);
        let (header, payload) = roundtrip(
            &cli_net,
            vec![
                Bytes::from(req_header.encode()),
                Bytes::from_static(b"ping"),
            ],
        )
        .await;

        assert_eq!(header.serial_no, 7);
        assert_eq!(header.func_no, 2);
        assert_eq!(header.code, RES_CODE_SUCCESS);
        assert_eq!(&payload[..], b"ping");
    }

    #[tokio::test]
    async fn test_dispatch_miss_replies_sys_err() {
        let (service, cli_net) = service_pair();
        service.clone().start();

        let req_header = PackHeader::new(Bytes::from_static(b"game"), 3, 42);
        let (header, payload) =
            roundtrip(&cli_net, vec![Bytes::from(req_header.encode())]).await;

        assert_eq!(header.code, RES_CODE_SYS_ERR);
        let text = String::from_utf8(payload.to_vec()).unwrap();
        assert!(text.contains("no handler for funcNo 42"));
    }

    #[tokio::test]
    async fn test_handler_error_replies_sys_err() {
        let (service, cli_net) = service_pair();
        service.add_processor(
            Arc::new(|_req, _resp, _t, _n| Err(RpcError::Config("boom".into()))),
            2,
            "explode",
        );
        service.clone().start();

        let req_header = PackHeader::new(Bytes::from_static(b"game"), 1, 2);
        let (header, payload) =
            roundtrip(&cli_net, vec![Bytes::from(req_header.encode())]).await;

        assert_eq!(header.code, RES_CODE_SYS_ERR);
        assert!(String::from_utf8(payload.to_vec()).unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_wrong_mark_dropped_loop_survives() {
        let (service, cli_net) = service_pair();
        service.add_processor(echo_handler(), 2, "echo");
        service.clone().start();

        // Wrong mark: no reply, loop keeps going.
        let bad = PackHeader::new(Bytes::from_static(b"chat"), 1, 2);
        cli_net
            .write_rpc_pack(1, 1, &[Bytes::from(bad.encode())])
            .await
            .unwrap();

        let good = PackHeader::new(Bytes::from_static(b"game"), 2, 2);
        let (header, _) = roundtrip(&cli_net, vec![Bytes::from(good.encode())]).await;
        assert_eq!(header.serial_no, 2);
    }

    #[tokio::test]
    async fn test_handler_panic_caught_without_debug_mode() {
        let (service, cli_net) = service_pair();
        service.add_processor(
            Arc::new(|_req, _resp, _t, _n| panic!("handler bug")),
            2,
            "panic",
        );
        service.add_processor(echo_handler(), 3, "echo");
        service.clone().start();

        // The panicking request produces no reply but must not kill the
        // loop.
        let bad = PackHeader::new(Bytes::from_static(b"game"), 1, 2);
        cli_net
            .write_rpc_pack(1, 1, &[Bytes::from(bad.encode())])
            .await
            .unwrap();

        let good = PackHeader::new(Bytes::from_static(b"game"), 2, 3);
        let (header, _) = roundtrip(&cli_net, vec![Bytes::from(good.encode())]).await;
        assert_eq!(header.serial_no, 2);
        assert_eq!(header.code, RES_CODE_SUCCESS);
    }

    #[tokio::test]
    async fn test_builtin_func_list_without_interceptor() {
        let (service, cli_net) = service_pair();
        service.add_processor(echo_handler(), 2, "echo");
        service.clone().start();

        let req_header = PackHeader::new(Bytes::from_static(b"game"), 5, FUNC_NO_FUNC_LIST);
        let (header, payload) =
            roundtrip(&cli_net, vec![Bytes::from(req_header.encode())]).await;

        assert_eq!(header.code, RES_CODE_SUCCESS);
        let resp: FetchFuncListResp = serde_json::from_slice(&payload).unwrap();
        assert_eq!(resp.func_mapper.get("echo"), Some(&2));
        assert_eq!(
            resp.func_mapper.get(FUNC_NAME_FUNC_LIST),
            Some(&FUNC_NO_FUNC_LIST)
        );
    }
}
