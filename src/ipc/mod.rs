//! IPC server for local operator tools

pub mod protocol;
pub mod server;

pub use protocol::{parse_command, serialize_response, Command, Generation, Response, PROTOCOL_VERSION};
pub use server::IpcServer;
