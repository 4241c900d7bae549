//! Authenticated WebSocket server with broadcast fan-out.
//!
//! ```text
//! Server (accept loop)
//!     |
//!     v
//! ConnectionHandler (one task per connection)
//!     |  Connecting -> AwaitingAuth -> Authenticated -> Closed
//!     |
//!     +-- registers with --> ConnectionRegistry <-- snapshot -- Broadcaster
//! ```
//!
//! A client proves knowledge of a shared secret with a single `auth`
//! message; afterwards it can ask for the host's configuration snapshot,
//! ping, and receives every broadcast the host sends.

mod broadcast;
mod config;
mod connection;
mod error;
mod registry;
mod server;
mod source;

pub use broadcast::{BroadcastReport, Broadcaster, SendFailure};
pub use config::ServerSettings;
pub use error::{ServerError, ServerResult};
pub use registry::{ClientHandle, ConnectionId, ConnectionRegistry};
pub use server::Server;
pub use source::{ConfigSource, StaticSource};

pub use botlink_core::Credential;
