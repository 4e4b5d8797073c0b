//! Backblaze B2 API client

pub mod client;
pub mod errors;
pub mod types;

pub use client::B2Client;
pub use errors::B2Error;
pub use types::{FileInfo, ListFilesResponse};
