//! Protocol module - wire format and in-memory packets.
//!
//! This module implements the binary protocol shared by both endpoint
//! roles:
//! - Mark-prefixed header encoding/decoding
//! - Pack/Request/Response types and the caller-side wait primitive
//! - The reserved function-list discovery constants

mod header;
mod pack;

pub use header::{
    check_rpc_mark, PackHeader, CODE_LEN, FIXED_TAIL_LEN, FUNC_NAME_FUNC_LIST, FUNC_NO_FUNC_LIST,
    FUNC_NO_LEN, RES_CODE_SUCCESS, RES_CODE_SYS_ERR, SERIAL_NO_LEN,
};
pub use pack::{FetchFuncListResp, Pack, Request, Response, ResponseWaiter};
