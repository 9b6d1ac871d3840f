//! TLS configuration, certificate generation and interception engines

pub mod cert_gen;
pub mod config;
pub mod mitm;

pub use cert_gen::*;
pub use config::*;
pub use mitm::*;
