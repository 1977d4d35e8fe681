//! HTTP/1.x wire codec: head parsing and serialization, chunked coding and
//! body transfer.

pub mod body;
pub mod chunked;
pub mod reader;
pub mod writer;

pub use body::{copy_body, drain_body, read_body, BodyFraming, MAX_LOADED_BODY};
pub use chunked::{chunk_decode, chunk_encode};
pub use reader::{detect_method, read_request, read_response, MAX_HEADER_BYTES, MAX_HEADER_COUNT};
pub use writer::{
    respond_with_status, write_request_head, write_response, write_response_head,
};
