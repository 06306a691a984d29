//! Validating admission webhook for Elasticsearch objects
//!
//! Deletes of `DoNotTerminate` objects are refused, as are creates and spec
//! updates that fail validation or touch a field fixed at creation. A
//! `DoNotTerminate` delete that gets past the webhook (for example while it
//! is not registered) is still undone by the termination path.

pub mod policies;
mod server;

pub use policies::{admit, check_termination_policy};
pub use server::{VALIDATE_PATH, WebhookError, router, run_webhook_server};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
