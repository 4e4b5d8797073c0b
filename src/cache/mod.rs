//! Snapshot building and caching
//!
//! The tree builder turns an enumeration into a rooted tree, the registry
//! stores and decodes generations, and the decoded cache keeps recent
//! trees in memory.

pub mod decoded;
pub mod registry;
pub mod tree;

pub use decoded::DecodedCache;
pub use registry::CacheRegistry;
