//! Event fabric and webhook ingress.
//!
//! Lifecycle changes travel the cluster as schema-validated events: each kind
//! has a bounded substrate stream (`events:<kind>`, replayable) and a fan-out
//! channel (`events.<kind>`, live). Publishing appends to the stream first —
//! once the append is acknowledged the event exists, even if the live
//! notification is lost.
//!
//! Inbound webhooks get the mirror treatment: signature-checked, recorded as
//! an intake row with an idempotency key, processed by a per-source handler,
//! and retried with exponential backoff while the attempt budget lasts.

pub mod envelope;
pub mod pg;
pub mod publisher;
pub mod schema;
pub mod webhook;
