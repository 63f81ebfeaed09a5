#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::BridgeError;

/// JSON-RPC envelopes and the MCP tool types carried inside them
pub mod model;

pub mod auth;
pub mod handler;
pub mod status;
pub mod store;
pub mod transport;

pub use auth::{AuthenticatedClient, CredentialCache};
pub use handler::{ToolContext, ToolDispatcher, ToolRouter};
pub use transport::{SessionRegistry, TransportSession};
