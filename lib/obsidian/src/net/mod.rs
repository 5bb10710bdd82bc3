pub mod buffer;
pub mod client;
pub mod endpoint;
pub mod link;
pub mod support;
