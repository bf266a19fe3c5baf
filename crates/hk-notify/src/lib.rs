//! Notification delivery pipeline.
//!
//! Notifications are rendered from `(kind, channel, language)` templates,
//! logged, and dispatched through per-channel adapters sitting behind
//! channel-named breakers. Transient failures re-enter the queue with
//! backoff; blocked recipients fail permanently; disabled channels no-op as
//! `skipped`. A `(correlation, channel, recipient)` triple that already went
//! out is never sent twice.

pub mod channels;
pub mod pg;
pub mod pipeline;
pub mod template;
