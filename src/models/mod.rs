//! Data models shared by the proxy engine and its hooks.

pub mod http;
pub mod session;
pub mod tls;
pub mod websocket;

pub use http::{Body, HeaderCollection, HttpVersion, Request, Response};
pub use session::{ConnectionInfo, SessionEventArgs, Timeline};
pub use tls::{ClientHelloInfo, ServerHelloInfo};
pub use websocket::*;
