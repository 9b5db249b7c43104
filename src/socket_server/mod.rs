//! Sockrelay Socket Server
//!
//! A bounded, concurrent connection server over a unix domain socket or TCP.
//! Each admitted client sends one request and receives one response line.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Server                                    │
//! │                    teardown stack, signal handling                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Listener ──► accept_loop ──Join──┐                                     │
//! │                                   ▼                                     │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                 Registry (single coordinating task)             │    │
//! │  │                                                                 │    │
//! │  │  session_id_1 ──► SessionEntry { peer, admitted_at, handler }   │    │
//! │  │  session_id_2 ──► SessionEntry { ... }                          │    │
//! │  │                                                                 │    │
//! │  │  full? ──► capacity message, close                              │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                   │ spawn                 ▲             │
//! │                                   ▼                       │ Error/Leave │
//! │  ProtocolHandler task per session ────────────────────────┘             │
//! │    - read header + body                                                 │
//! │    - apply Computation                                                  │
//! │    - write one response line                                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! ```text
//! // Client -> Server
//! foo.txt\n
//! ab\n
//! cd\n
//! <half-close>
//!
//! // Server -> Client
//! 4\n
//! ```

pub mod handler;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use handler::ProtocolHandler;
pub use listener::Listener;
pub use protocol::{Computation, ComputationKind, Echo, FileLookup, LetterCount, Request};
pub use registry::{
    EventSender, Registry, RegistryEvent, RegistryHandle, RegistrySnapshot, RegistryStats,
};
pub use server::Server;
pub use session::{IdGenerator, PeerAddr, Session, SessionId};
