//! Prototype registry and reuse pool.
//!
//! Request/response payload objects are opaque to the core: the only
//! operations it needs are "marshal", "unmarshal", and "reset for reuse".
//! The [`Proto`] trait captures exactly that and is implemented for free by
//! every `serde`-able type with a `Default`.
//!
//! The [`ProtoBinder`] maps function names to their request/response
//! prototypes and keeps a bounded free-list per prototype so the dispatch
//! path can recycle objects instead of allocating per packet.
//!
//! # Example
//!
//! ```
//! use markrpc::proto::{ProtoBinder, proto_name};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Echo { msg: String }
//!
//! let binder = ProtoBinder::new();
//! binder.register_proto::<Echo>().unwrap();
//! binder.bind_proto("game.echo", proto_name::<Echo>(), proto_name::<Echo>()).unwrap();
//!
//! let req = binder.get_request("game.echo").unwrap();
//! binder.reuse_request(req, "game.echo").unwrap();
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError};

/// Warm capacity of each prototype free-list.
pub const INIT_REUSE_COUNT: usize = 10;

/// Upper bound of each prototype free-list; overflow is dropped.
pub const MAX_REUSE_COUNT: usize = 100;

/// Payload encoding selector for [`Proto::marshal`] / [`Proto::unmarshal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCodec {
    /// JSON via `serde_json`.
    Json,
    /// MessagePack via `rmp-serde`, struct-as-map format.
    MsgPack,
}

/// An opaque payload object: marshal, unmarshal, reset.
///
/// Implemented blanket-wise for every `Serialize + DeserializeOwned +
/// Default` type, so application payload structs need no extra code.
pub trait Proto: Any + Send + Sync {
    /// Upcast for handler-side downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for handler-side downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Restore the default state before the object re-enters the pool.
    fn reset(&mut self);

    /// Encode with the given codec.
    fn marshal(&self, codec: WireCodec) -> Result<Vec<u8>>;

    /// Decode in place with the given codec.
    fn unmarshal(&mut self, codec: WireCodec, data: &[u8]) -> Result<()>;
}

impl<T> Proto for T
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn reset(&mut self) {
        *self = T::default();
    }

    fn marshal(&self, codec: WireCodec) -> Result<Vec<u8>> {
        match codec {
            WireCodec::Json => Ok(serde_json::to_vec(self)?),
            // to_vec_named: structs as maps, not positional arrays.
            WireCodec::MsgPack => Ok(rmp_serde::to_vec_named(self)?),
        }
    }

    fn unmarshal(&mut self, codec: WireCodec, data: &[u8]) -> Result<()> {
        match codec {
            WireCodec::Json => *self = serde_json::from_slice(data)?,
            WireCodec::MsgPack => *self = rmp_serde::from_slice(data)?,
        }
        Ok(())
    }
}

/// The short, type-derived name a prototype registers under.
pub fn proto_name<T: 'static>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Payload slot handed to service handlers.
///
/// With an interceptor installed the slots carry typed prototypes; without
/// one the request slot carries the raw payload bytes and the handler is
/// expected to leave bytes (or nothing) in the response slot.
pub enum Body {
    /// No payload on this side.
    Empty,
    /// Raw payload bytes (interceptor-less mode).
    Bytes(Vec<u8>),
    /// A typed prototype, usually pooled.
    Proto(Box<dyn Proto>),
}

impl Body {
    /// Borrow the typed payload, if this slot holds one of type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Body::Proto(p) => p.as_any().downcast_ref(),
            _ => None,
        }
    }

    /// Mutably borrow the typed payload, if this slot holds one of type `T`.
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        match self {
            Body::Proto(p) => p.as_any_mut().downcast_mut(),
            _ => None,
        }
    }

    /// Borrow the raw bytes, if this slot holds any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// True when the slot holds nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Move the content out, leaving `Empty` behind.
    pub fn take(&mut self) -> Body {
        std::mem::replace(self, Body::Empty)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Proto(_) => f.write_str("Body::Proto(..)"),
        }
    }
}

type MakeFn = Box<dyn Fn() -> Box<dyn Proto> + Send + Sync>;

struct ProtoEntry {
    make: MakeFn,
    pool: Vec<Box<dyn Proto>>,
}

#[derive(Default)]
struct Inner {
    protos: HashMap<String, ProtoEntry>,
    func_req: HashMap<String, String>,
    func_resp: HashMap<String, String>,
}

/// Registry mapping function names to request/response prototypes, with a
/// bounded per-prototype reuse pool.
///
/// A single mutex guards the tables and pools; it is held only for map
/// mutation, so handler threads and the dispatch thread can share one
/// binder freely.
pub struct ProtoBinder {
    inner: Mutex<Inner>,
}

impl ProtoBinder {
    /// Create an empty binder.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a prototype under its type-derived name.
    ///
    /// # Errors
    ///
    /// [`RpcError::ProtoExist`] if the name is already registered.
    pub fn register_proto<T: Proto + Default>(&self) -> Result<()> {
        let name = proto_name::<T>();
        let mut inner = self.lock();

        if inner.protos.contains_key(name) {
            return Err(RpcError::ProtoExist);
        }

        inner.protos.insert(
            name.to_string(),
            ProtoEntry {
                make: Box::new(|| Box::<T>::default()),
                pool: Vec::with_capacity(INIT_REUSE_COUNT),
            },
        );
        Ok(())
    }

    /// Associate a function with its request/response prototype names.
    ///
    /// Either name may be empty, meaning "no body on that side"; a function
    /// may be request-only (fire-and-forget) or response-only
    /// (server-initiated).
    ///
    /// # Errors
    ///
    /// [`RpcError::ProtoExist`] if the function already has a binding on a
    /// named side, [`RpcError::ProtoNotExist`] if a named prototype was
    /// never registered. On error nothing is recorded.
    pub fn bind_proto(&self, func_name: &str, req_name: &str, resp_name: &str) -> Result<()> {
        let mut inner = self.lock();

        if !req_name.is_empty() {
            if inner.func_req.contains_key(func_name) {
                return Err(RpcError::ProtoExist);
            }
            if !inner.protos.contains_key(req_name) {
                return Err(RpcError::ProtoNotExist);
            }
        }

        if !resp_name.is_empty() {
            if inner.func_resp.contains_key(func_name) {
                return Err(RpcError::ProtoExist);
            }
            if !inner.protos.contains_key(resp_name) {
                return Err(RpcError::ProtoNotExist);
            }
        }

        if !req_name.is_empty() {
            inner
                .func_req
                .insert(func_name.to_string(), req_name.to_string());
        }

        if !resp_name.is_empty() {
            inner
                .func_resp
                .insert(func_name.to_string(), resp_name.to_string());
        }

        Ok(())
    }

    /// Produce a fresh-or-recycled request object for `func_name`.
    pub fn get_request(&self, func_name: &str) -> Result<Box<dyn Proto>> {
        self.get(func_name, true)
    }

    /// Produce a fresh-or-recycled response object for `func_name`.
    pub fn get_response(&self, func_name: &str) -> Result<Box<dyn Proto>> {
        self.get(func_name, false)
    }

    /// Return a request object to its pool.
    ///
    /// The object is reset before it becomes available again; if the pool
    /// is full it is simply dropped.
    pub fn reuse_request(&self, obj: Box<dyn Proto>, func_name: &str) -> Result<()> {
        self.reuse(obj, func_name, true)
    }

    /// Return a response object to its pool.
    pub fn reuse_response(&self, obj: Box<dyn Proto>, func_name: &str) -> Result<()> {
        self.reuse(obj, func_name, false)
    }

    /// Number of pooled instances for a prototype name. Zero for unknown
    /// names.
    pub fn pooled_count(&self, proto_name: &str) -> usize {
        self.lock()
            .protos
            .get(proto_name)
            .map_or(0, |e| e.pool.len())
    }

    fn get(&self, func_name: &str, request_side: bool) -> Result<Box<dyn Proto>> {
        let mut inner = self.lock();
        let map = if request_side {
            &inner.func_req
        } else {
            &inner.func_resp
        };

        let proto = map.get(func_name).cloned().ok_or(RpcError::ProtoNotExist)?;
        let entry = inner
            .protos
            .get_mut(&proto)
            .ok_or(RpcError::ProtoNotExist)?;

        Ok(entry.pool.pop().unwrap_or_else(|| (entry.make)()))
    }

    fn reuse(&self, mut obj: Box<dyn Proto>, func_name: &str, request_side: bool) -> Result<()> {
        let mut inner = self.lock();
        let map = if request_side {
            &inner.func_req
        } else {
            &inner.func_resp
        };

        let proto = map.get(func_name).cloned().ok_or(RpcError::ProtoNotExist)?;
        let entry = inner
            .protos
            .get_mut(&proto)
            .ok_or(RpcError::ProtoNotExist)?;

        if entry.pool.len() < MAX_REUSE_COUNT {
            obj.reset();
            entry.pool.push(obj);
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ProtoBinder {
    fn default() -> Self {
        Self::new()
    }
}
