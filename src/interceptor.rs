//! Pluggable payload codecs for both endpoint roles.
//!
//! The core never touches application encodings. The caller side marshals
//! request objects and unmarshals response objects through an
//! [`Interceptor`]; the callee side reconstructs typed request/response
//! objects (from the [`ProtoBinder`] pool) and marshals the response
//! through a [`ServiceInterceptor`].
//!
//! JSON and MessagePack implementations ship with the crate; anything else
//! is a dozen lines of the same shape.

use std::sync::Arc;

use crate::error::{Result, RpcError};
use crate::proto::{Body, Proto, ProtoBinder, WireCodec};

/// Caller-side marshal/unmarshal hooks.
pub trait Interceptor: Send + Sync {
    /// Marshal the request object into payload bytes.
    ///
    /// `func_name` is the full function name (`mark.func`).
    fn on_marshal(&self, func_name: &str, obj: &dyn Proto) -> Result<Vec<u8>>;

    /// Unmarshal response payload bytes into the caller's response object.
    fn on_unmarshal(&self, func_name: &str, data: &[u8], obj: &mut dyn Proto) -> Result<()>;
}

/// Callee-side hooks around handler invocation.
pub trait ServiceInterceptor: Send + Sync {
    /// Build the typed request/response slots for a dispatch cycle.
    ///
    /// Implementations draw prototypes from the binder pool and unmarshal
    /// the inbound payload into the request slot.
    fn on_pre_handle(&self, func_name: &str, payload: &[u8]) -> Result<(Body, Body)>;

    /// Marshal the response slot and return both slots to the pool.
    ///
    /// Returns the response payload, or `None` for a bodiless reply. Each
    /// pooled object is returned exactly once per cycle.
    fn on_handle_completion(&self, func_name: &str, req: Body, resp: Body)
        -> Result<Option<Vec<u8>>>;
}

/// Caller-side JSON interceptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonInterceptor;

impl Interceptor for JsonInterceptor {
    fn on_marshal(&self, _func_name: &str, obj: &dyn Proto) -> Result<Vec<u8>> {
        obj.marshal(WireCodec::Json)
    }

    fn on_unmarshal(&self, _func_name: &str, data: &[u8], obj: &mut dyn Proto) -> Result<()> {
        obj.unmarshal(WireCodec::Json, data)
    }
}

/// Caller-side MessagePack interceptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackInterceptor;

impl Interceptor for MsgPackInterceptor {
    fn on_marshal(&self, _func_name: &str, obj: &dyn Proto) -> Result<Vec<u8>> {
        obj.marshal(WireCodec::MsgPack)
    }

    fn on_unmarshal(&self, _func_name: &str, data: &[u8], obj: &mut dyn Proto) -> Result<()> {
        obj.unmarshal(WireCodec::MsgPack, data)
    }
}

fn pre_handle(
    binder: &ProtoBinder,
    codec: WireCodec,
    func_name: &str,
    payload: &[u8],
) -> Result<(Body, Body)> {
    let req = match binder.get_request(func_name) {
        Ok(mut obj) => {
            obj.unmarshal(codec, payload)?;
            Body::Proto(obj)
        }
        // Response-only functions carry no request body; a payload with no
        // binding to receive it is a configuration error.
        Err(RpcError::ProtoNotExist) if payload.is_empty() => Body::Empty,
        Err(e) => return Err(e),
    };

    let resp = match binder.get_response(func_name) {
        Ok(obj) => Body::Proto(obj),
        Err(_) => Body::Empty,
    };

    Ok((req, resp))
}

fn handle_completion(
    binder: &ProtoBinder,
    codec: WireCodec,
    func_name: &str,
    req: Body,
    resp: Body,
) -> Result<Option<Vec<u8>>> {
    let payload = match &resp {
        Body::Proto(obj) => Some(obj.marshal(codec)?),
        Body::Bytes(b) => Some(b.clone()),
        Body::Empty => None,
    };

    if let Body::Proto(obj) = req {
        // Unknown to the pool (e.g. the discovery built-in) just drops.
        let _ = binder.reuse_request(obj, func_name);
    }
    if let Body::Proto(obj) = resp {
        let _ = binder.reuse_response(obj, func_name);
    }

    Ok(payload)
}

/// Callee-side JSON interceptor backed by a [`ProtoBinder`].
pub struct JsonServiceInterceptor {
    binder: Arc<ProtoBinder>,
}

impl JsonServiceInterceptor {
    /// Create over the binder the service's functions are bound in.
    pub fn new(binder: Arc<ProtoBinder>) -> Self {
        Self { binder }
    }
}

impl ServiceInterceptor for JsonServiceInterceptor {
    fn on_pre_handle(&self, func_name: &str, payload: &[u8]) -> Result<(Body, Body)> {
        pre_handle(&self.binder, WireCodec::Json, func_name, payload)
    }

    fn on_handle_completion(
        &self,
        func_name: &str,
        req: Body,
        resp: Body,
    ) -> Result<Option<Vec<u8>>> {
        handle_completion(&self.binder, WireCodec::Json, func_name, req, resp)
    }
}

/// Callee-side MessagePack interceptor backed by a [`ProtoBinder`].
pub struct MsgPackServiceInterceptor {
    binder: Arc<ProtoBinder>,
}

impl MsgPackServiceInterceptor {
    /// Create over the binder the service's functions are bound in.
    pub fn new(binder: Arc<ProtoBinder>) -> Self {
        Self { binder }
    }
}

impl ServiceInterceptor for MsgPackServiceInterceptor {
    fn on_pre_handle(&self, func_name: &str, payload: &[u8]) -> Result<(Body, Body)> {
        pre_handle(&self.binder, WireCodec::MsgPack, func_name, payload)
    }

    fn on_handle_completion(
        &self,
        func_name: &str,
        req: Body,
        resp: Body,
    ) -> Result<Option<Vec<u8>>> {
        handle_completion(&self.binder, WireCodec::MsgPack, func_name, req, resp)
    }
}
