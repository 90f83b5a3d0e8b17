//! Signaling-Relay
//!
//! Routet Offer/Answer/Candidates zwischen verbundenen Identitäten.

mod router;
mod server;

pub use router::{ConnectionId, RouteOutcome, Router, RELAY_ID};
pub use server::RelayServer;
