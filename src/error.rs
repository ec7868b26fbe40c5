//! Error types for markrpc.

use thiserror::Error;

/// Main error type for all markrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The mark prefix of an inbound packet did not match the channel mark.
    #[error("rpc mark check failed")]
    MarkCheckFailed,

    /// Packet shorter than the fixed header length.
    #[error("pack header data not enough")]
    HeaderTooSmall,

    /// Prototype or binding already registered under that name.
    #[error("proto has exist")]
    ProtoExist,

    /// Prototype or binding not registered.
    #[error("proto not exist")]
    ProtoNotExist,

    /// Function name unknown to this pipeline (discovery not run, or the
    /// peer never exported it).
    #[error("not support this func")]
    NotSupportFunc,

    /// A typed call was issued before an interceptor was installed.
    #[error("interceptor is nil")]
    InterceptorNil,

    /// The pipeline was stopped while this call was in flight.
    #[error("force call stop")]
    ForceCallStop,

    /// No response arrived within the per-call timeout.
    #[error("call timeout after {0}s")]
    CallTimeout(u32),

    /// The transport read queue was closed.
    #[error("read channel closed")]
    ReadChanClose,

    /// The transport was closed before or during a write.
    #[error("rpc net closed")]
    NetClosed,

    /// No handler installed for the requested function number.
    #[error("no handler for funcNo {0}")]
    NoHandler(u16),

    /// A raw-bytes service handler left a typed object in the response slot.
    #[error("return value format wrong")]
    WrongFormatRet,

    /// Registry lookup miss: no pipeline or service under that key.
    #[error("service not exist")]
    ServiceNotExist,

    /// The remote replied with a non-success code outside a normal call
    /// (e.g. during discovery).
    #[error("remote error (code {code}): {message}")]
    Remote { code: i32, message: String },

    /// Handler misconfiguration reported at setup time.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
