//! Signed DNS update service
//!
//! Publishers register DNS records by sending signed UDP update packets;
//! address queries against the published data are answered with targets
//! ranked by geographic proximity to the requester.
//!
//! # Module Structure
//!
//! * `buffer` - low-level packet buffer operations
//! * `protocol` - update protocol packet structures and codec
//! * `attrs` - typed attributes carried on records
//! * `validate` - syntax checks for request element fields
//! * `auth` - signature verification and account identity
//! * `store` - account/subdomain state and the backend contract
//! * `kvstore` - replicated key/value store client and backend
//! * `processor` - per-packet request processing state machine
//! * `server` - UDP listener and dispatch
//! * `proximity` - geo-distance ranking of address answers
//! * `client` - update submission client
//! * `context` - server configuration and shared state

/// Low-level buffer operations for packet handling
pub mod buffer;

/// Typed attributes attached to published records
pub mod attrs;

/// Update protocol definitions and packet structures
pub mod protocol;

/// Field validators for request elements
pub mod validate;

/// Packet authentication and account identity
pub mod auth;

/// Account and subdomain state, and the backend contract
pub mod store;

/// Replicated key/value store client and backend adapter
pub mod kvstore;

/// Request processing state machine
pub mod processor;

/// UDP server implementation
pub mod server;

/// Proximity ranking for address answers
pub mod proximity;

/// Update submission client
pub mod client;

/// Server configuration and shared context
pub mod context;
