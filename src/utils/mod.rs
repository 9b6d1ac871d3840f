//! Utility functions for the proxy

pub mod http;
pub mod time;

pub use self::http::*;
pub use self::time::*;
