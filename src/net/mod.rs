//! Endpoint resolution and socket setup.
//!
//! Everything here is the "already-resolved address, already-a-socket"
//! collaborator layer spec.md treats as out of scope beyond its contract;
//! it exists so the binary can actually run end to end.

mod endpoint;
mod socket;

pub use endpoint::Endpoint;
pub use socket::{begin_connect, create_client_socket, create_listener, take_socket_error, ConnectOutcome};
