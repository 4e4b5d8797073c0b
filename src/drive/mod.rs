//! Google Drive remote tree source

pub mod client;
pub mod token;
pub mod types;

pub use client::{DriveClient, DriveProvider};
pub use token::{AccessTokens, OAuthApp};
