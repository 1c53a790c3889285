//! # toolwarden-proxy
//!
//! Stdio JSON-RPC interceptor that wraps a downstream tool server and runs
//! every `tools/call` request through the toolwarden decision engine before
//! it reaches the downstream. Everything else on the wire is relayed
//! byte-for-byte.

pub mod interceptor;
pub mod jsonrpc;
pub mod webhook;

use std::sync::Arc;

use anyhow::Result;

use interceptor::{Interceptor, InterceptorConfig};
use toolwarden_core::sentinel::Sentinel;

/// Run the stdio interceptor until the downstream exits or the client
/// closes stdin. Returns the downstream's exit code.
pub async fn run_stdio(sentinel: Arc<Sentinel>, config: InterceptorConfig) -> Result<i32> {
    Interceptor::new(sentinel, config).run().await
}
