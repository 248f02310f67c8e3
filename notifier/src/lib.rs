//! Fire-and-forget sinks: customer/NOC email and metrics counters.
//!
//! Both sinks are invoked from success and failure paths of the workers and
//! must tolerate concurrent use. Neither ever fails a worker; send errors
//! are logged and dropped.

pub mod email;
pub mod metrics;

pub use email::EmailNotifier;
pub use metrics::Metrics;
