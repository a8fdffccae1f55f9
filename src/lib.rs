//! DONAR update service
//!
//! A DNS publishing service in Rust: independent publishers register and
//! update resource records through a signed UDP update protocol, and address
//! queries are answered with the published targets ranked by geographic
//! proximity to the requesting client.
//!
//! # Features
//!
//! * Binary update protocol with per-packet Ed25519 signatures
//! * Per-account sequence numbers with optional strict checking
//! * Record storage in a replicated key/value store behind a backend trait
//! * Proximity-ranked address answers via a MaxMind geo database
//! * Load-shedding UDP dispatch, one handler per datagram

/// Update service implementation and protocol handling
pub mod dns;
