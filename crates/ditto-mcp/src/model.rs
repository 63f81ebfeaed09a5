mod jsonrpc;
mod tool;

pub use jsonrpc::*;
pub use tool::*;

pub type JsonObject<F = serde_json::Value> = serde_json::Map<String, F>;
