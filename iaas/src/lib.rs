//! IaaS API layer: the canonical resource state machine, the self-refreshing
//! process token, the serde models for the resources the agent consumes, and
//! the authenticated HTTP client with pagination and token-expiry retry.

pub mod client;
pub mod resource;
pub mod state;
pub mod token;

pub use client::{ApiError, Client, Result};
pub use state::{Operation, ResourceKind, State, Transition};
