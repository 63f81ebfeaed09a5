//! What a [`TransportSession`](crate::transport::TransportSession) hands decoded
//! messages to.

mod dispatcher;
mod router;
mod toolset;

pub use dispatcher::{ToolContext, ToolDispatcher};
pub use router::ToolRouter;
pub use toolset::{ToolError, ToolHandlerFn, Toolset, ToolsetBuilder};
