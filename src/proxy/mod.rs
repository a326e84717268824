pub mod classify;
pub mod context;
pub mod forward;
mod handler;
pub mod policy;
pub mod sse;
mod streaming;
mod unary;

pub use context::{BoxBody, InboundRequest};
pub use forward::Forwarder;
pub use handler::handle_request;
