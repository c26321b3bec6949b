//! IPC layer: control socket protocol, server, and command handler

mod handler;
mod protocol;
mod server;

pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcFailure, IpcResponse,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{IpcClient, IpcServer};
