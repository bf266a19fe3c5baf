//! Streaming upload core for the media service.
//!
//! Uploads never sit in memory: chunks stream to a temp file with the running
//! total checked against the cap on every chunk, and the temp file is removed
//! on every exit path. The first 512 bytes decide the real content type; a
//! declared type that disagrees is logged and overruled.

pub mod limits;
pub mod sniff;
pub mod upload;
