//! Extension protocol (BEP 10) types.

mod handshake;

pub use handshake::ExtensionHandshake;
