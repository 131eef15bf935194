// Common utilities shared across the control plane.

pub mod redact;

pub use redact::{redact, redact_headers, redact_json};
