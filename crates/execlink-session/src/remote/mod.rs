//! Execution directory implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "memory")]
pub use memory::MemoryDirectory;

#[cfg(feature = "http")]
pub use http::HttpDirectory;
