//! The interceptor: stdio sequencer between the agent and the downstream
//! tool server.
//!
//! Wraps the downstream as a child process. Non-tool-call traffic is relayed
//! byte-for-byte in both directions. `tools/call` requests run the full
//! pipeline: context extraction, sentinel decision (write-ahead audited),
//! then forward, deny, or ask. Forwarded requests are correlated back to
//! their replies through a pending table keyed by request id, with a
//! 15-second timeout racing each reply.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use toolwarden_core::audit::ResponseStatus;
use toolwarden_core::policy::PolicyContext;
use toolwarden_core::sentinel::{Decision, Sentinel};

use crate::jsonrpc::parser::{serialize_message, RawJsonRpcMessage, StreamParser};
use crate::jsonrpc::types::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, CONFIRMATION_REQUIRED_CODE,
    INTERNAL_ERROR_CODE, POLICY_VIOLATION_CODE, REQUEST_TIMEOUT_CODE,
};
use crate::webhook;

/// Default downstream reply timeout.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between maintenance sweeps.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Interceptor configuration.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Downstream server binary to spawn.
    pub downstream_cmd: String,
    /// Arguments for the downstream server.
    pub downstream_args: Vec<String>,
    pub forward_timeout: Duration,
    /// Optional localhost webhook for alert notifications.
    pub alert_webhook_url: Option<String>,
}

/// Counters exposed for the shutdown summary.
#[derive(Debug, Default)]
pub struct InterceptorMetrics {
    pub total: AtomicU64,
    pub forwarded: AtomicU64,
    pub denied: AtomicU64,
    pub asked: AtomicU64,
    pub timeouts: AtomicU64,
    pub passthrough: AtomicU64,
}

impl InterceptorMetrics {
    fn snapshot(&self) -> String {
        format!(
            "total={} forwarded={} denied={} asked={} timeouts={} passthrough={}",
            self.total.load(Ordering::Relaxed),
            self.forwarded.load(Ordering::Relaxed),
            self.denied.load(Ordering::Relaxed),
            self.asked.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.passthrough.load(Ordering::Relaxed),
        )
    }
}

/// One in-flight forwarded request. Owned by the pending table; whoever
/// removes the entry (reply, timeout, or disconnect) settles the request.
#[derive(Debug, Clone)]
struct PendingReply {
    sequence_number: i64,
    host: String,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingReply>>>;

/// State shared between the relay tasks.
pub(crate) struct RelayShared {
    sentinel: Arc<Sentinel>,
    pending: PendingMap,
    metrics: Arc<InterceptorMetrics>,
    forward_timeout: Duration,
    alert_webhook_url: Option<String>,
    http: reqwest::Client,
    /// Flipped to true at shutdown; cancels armed timeout tasks.
    shutdown: tokio::sync::watch::Sender<bool>,
}

pub struct Interceptor {
    config: InterceptorConfig,
    shared: Arc<RelayShared>,
}

impl Interceptor {
    pub fn new(sentinel: Arc<Sentinel>, config: InterceptorConfig) -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let shared = Arc::new(RelayShared {
            sentinel,
            pending: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(InterceptorMetrics::default()),
            forward_timeout: config.forward_timeout,
            alert_webhook_url: config.alert_webhook_url.clone(),
            http: reqwest::Client::new(),
            shutdown,
        });
        Self { config, shared }
    }

    pub fn metrics(&self) -> Arc<InterceptorMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Run the relay loop. Returns the downstream's exit code once it exits
    /// or the client closes stdin.
    pub async fn run(&self) -> Result<i32> {
        info!(
            cmd = %self.config.downstream_cmd,
            args = ?self.config.downstream_args,
            "spawning downstream tool server"
        );

        let mut child = Command::new(&self.config.downstream_cmd)
            .args(&self.config.downstream_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn downstream: {}", self.config.downstream_cmd))?;

        let child_stdin = child.stdin.take().context("failed to capture downstream stdin")?;
        let child_stdout = child.stdout.take().context("failed to capture downstream stdout")?;

        // Writer channels decouple the relays from pipe backpressure.
        let (child_tx, mut child_rx) = mpsc::channel::<Vec<u8>>(512);
        let (client_tx, mut client_rx) = mpsc::channel::<Vec<u8>>(512);

        let mut child_writer = tokio::io::BufWriter::new(child_stdin);
        let child_writer_handle = tokio::spawn(async move {
            while let Some(bytes) = child_rx.recv().await {
                if child_writer.write_all(&bytes).await.is_err() {
                    error!("error writing to downstream stdin");
                    break;
                }
                if child_writer.flush().await.is_err() {
                    break;
                }
            }
            drop(child_writer);
        });

        let mut client_writer = tokio::io::BufWriter::new(tokio::io::stdout());
        let client_writer_handle = tokio::spawn(async move {
            while let Some(bytes) = client_rx.recv().await {
                if client_writer.write_all(&bytes).await.is_err() {
                    error!("error writing to client stdout");
                    break;
                }
                if client_writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Client -> downstream relay.
        let shared = Arc::clone(&self.shared);
        let child_tx_relay = child_tx.clone();
        let client_tx_relay = client_tx.clone();
        let mut client_relay_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(tokio::io::stdin());
            let mut parser = StreamParser::new();
            let mut buf = String::new();
            loop {
                buf.clear();
                match reader.read_line(&mut buf).await {
                    Ok(0) => {
                        info!("client closed stdin, shutting down client relay");
                        break;
                    }
                    Ok(_) => {
                        parser.feed(buf.as_bytes());
                        while let Some(parse_result) = parser.next_raw_message() {
                            match parse_result {
                                Ok(raw) => {
                                    if let Err(e) = handle_client_message(
                                        &shared,
                                        raw,
                                        &child_tx_relay,
                                        &client_tx_relay,
                                    )
                                    .await
                                    {
                                        error!("error handling client message: {e:#}");
                                    }
                                }
                                // No reply is possible: the request id is unknown.
                                Err(e) => warn!("malformed client message, dropping: {e:#}"),
                            }
                        }
                    }
                    Err(e) => {
                        error!("error reading client stdin: {e}");
                        break;
                    }
                }
            }
        });

        // Downstream -> client relay.
        let shared = Arc::clone(&self.shared);
        let client_tx_down = client_tx.clone();
        let mut server_relay_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(child_stdout);
            let mut parser = StreamParser::new();
            let mut buf = String::new();
            loop {
                buf.clear();
                match reader.read_line(&mut buf).await {
                    Ok(0) => {
                        info!("downstream closed stdout, shutting down server relay");
                        break;
                    }
                    Ok(_) => {
                        parser.feed(buf.as_bytes());
                        while let Some(parse_result) = parser.next_raw_message() {
                            match parse_result {
                                Ok(raw) => {
                                    if let Err(e) =
                                        handle_downstream_message(&shared, raw, &client_tx_down).await
                                    {
                                        error!("error handling downstream message: {e:#}");
                                    }
                                }
                                // Pending callbacks will time out normally.
                                Err(e) => warn!("malformed downstream message, dropping: {e:#}"),
                            }
                        }
                    }
                    Err(e) => {
                        error!("error reading downstream stdout: {e}");
                        break;
                    }
                }
            }
        });

        // Held as an Option so the client-EOF branch can close downstream
        // stdin early while the other branches close it at cleanup.
        let mut child_tx = Some(child_tx);

        // Background maintenance sweep.
        let sentinel_for_sweep = Arc::clone(&self.shared.sentinel);
        let maintenance_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                if let Err(e) = sentinel_for_sweep.run_maintenance(now) {
                    warn!("maintenance sweep failed: {e:#}");
                }
            }
        });

        let exit_code = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(s) => {
                        info!("downstream exited with status: {s}");
                        s.code().unwrap_or(1)
                    }
                    Err(e) => {
                        error!("error waiting for downstream: {e}");
                        1
                    }
                }
            }
            _ = &mut client_relay_handle => {
                info!("client relay finished, closing downstream stdin");
                child_tx.take();
                match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                    Ok(Ok(s)) => s.code().unwrap_or(0),
                    Ok(Err(e)) => {
                        error!("error waiting for downstream: {e}");
                        1
                    }
                    Err(_) => {
                        warn!("downstream did not exit within 5s after stdin EOF, killing");
                        let _ = child.kill().await;
                        1
                    }
                }
            }
            _ = &mut server_relay_handle => {
                info!("server relay finished");
                match child.wait().await {
                    Ok(s) => s.code().unwrap_or(1),
                    Err(_) => 1,
                }
            }
        };

        maintenance_handle.abort();
        // The losing relay may still be blocked on a read; abort both so the
        // writer channels can close and drain.
        client_relay_handle.abort();
        server_relay_handle.abort();

        // Downstream is gone: fail every pending forward and cancel any
        // armed timeout tasks still holding writer handles.
        fail_all_pending(&self.shared, &client_tx).await;
        let _ = self.shared.shutdown.send(true);

        drop(child_tx);
        drop(client_tx);
        let _ = child_writer_handle.await;
        let _ = client_writer_handle.await;

        info!(metrics = %self.shared.metrics.snapshot(), "interceptor finished");
        Ok(exit_code)
    }
}

/// A tool call extracted from a `tools/call` request.
#[derive(Debug, Clone)]
pub(crate) struct ToolCall {
    pub id: RequestId,
    pub context: PolicyContext,
}

/// Extract the policy context from a request, if it is a tool call.
///
/// `host` comes from `arguments.host` (default `"local"`), `agent` from
/// `params.agent` (default `"unknown"`). A presented confirmation token is
/// lifted out of the arguments so it perturbs neither argument-pattern
/// matching nor anomaly fingerprints.
pub(crate) fn extract_tool_call(request: &JsonRpcRequest) -> Option<ToolCall> {
    if request.method != "tools/call" {
        return None;
    }
    let params = request.params.as_ref()?.as_object()?;
    let tool = params.get("name")?.as_str()?.to_string();

    let mut arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if !arguments.is_object() {
        arguments = json!({});
    }

    let host = arguments
        .get("host")
        .and_then(Value::as_str)
        .unwrap_or("local")
        .to_string();
    let agent = params
        .get("agent")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let token = arguments
        .as_object_mut()
        .and_then(|map| {
            map.remove("confirmation_token")
                .or_else(|| map.remove("confirmationToken"))
        })
        .and_then(|v| v.as_str().map(str::to_string));

    let mut context = PolicyContext::new(tool, host, agent, arguments);
    context.confirmation_token = token;
    Some(ToolCall { id: request.id.clone(), context })
}

/// Process one message from the client.
pub(crate) async fn handle_client_message(
    shared: &Arc<RelayShared>,
    raw: RawJsonRpcMessage,
    child_tx: &mpsc::Sender<Vec<u8>>,
    client_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    shared.metrics.total.fetch_add(1, Ordering::Relaxed);

    let tool_call = match &raw.parsed {
        JsonRpcMessage::Request(request) => extract_tool_call(request),
        // Notifications, responses, and everything else pass through
        // unmodified and uncorrelated.
        _ => None,
    };

    let Some(call) = tool_call else {
        shared.metrics.passthrough.fetch_add(1, Ordering::Relaxed);
        child_tx
            .send(raw.forward_bytes())
            .await
            .map_err(|_| anyhow::anyhow!("downstream channel closed"))?;
        return Ok(());
    };

    let decision = match shared.sentinel.decide(&call.context) {
        Ok(decision) => decision,
        Err(e) => {
            // Store failure: fatal to this request, surfaced like a
            // downstream error. The transaction rolled back cleanly.
            error!("sentinel decision failed: {e:#}");
            let reply = make_internal_error(&call.id, "Internal error");
            client_tx
                .send(serialize_message(&reply))
                .await
                .map_err(|_| anyhow::anyhow!("client channel closed"))?;
            return Ok(());
        }
    };

    if let (Some(url), Some(notification)) = (&shared.alert_webhook_url, decision.alert.clone()) {
        webhook::dispatch(&shared.http, url, notification);
    }

    let verdict = &decision.verdict;
    if verdict.allowed {
        debug!(tool = %call.context.tool, reason = %verdict.reason, "forwarding");
        shared.metrics.forwarded.fetch_add(1, Ordering::Relaxed);
        forward_with_timeout(shared, &call, &decision, raw, child_tx, client_tx).await
    } else if verdict.requires_confirmation {
        shared.metrics.asked.fetch_add(1, Ordering::Relaxed);
        let reply = make_confirmation_required(&call.id, verdict);
        shared
            .sentinel
            .mark_rejected(decision.sequence_number, "Confirmation required")?;
        info!(tool = %call.context.tool, host = %call.context.host, "confirmation required");
        client_tx
            .send(serialize_message(&reply))
            .await
            .map_err(|_| anyhow::anyhow!("client channel closed"))?;
        Ok(())
    } else {
        shared.metrics.denied.fetch_add(1, Ordering::Relaxed);
        let reply = make_policy_violation(&call.id, verdict);
        shared.sentinel.mark_rejected(decision.sequence_number, &verdict.reason)?;
        info!(tool = %call.context.tool, host = %call.context.host, reason = %verdict.reason, "denied");
        client_tx
            .send(serialize_message(&reply))
            .await
            .map_err(|_| anyhow::anyhow!("client channel closed"))?;
        Ok(())
    }
}

/// Register the pending reply, forward the original bytes, and arm the
/// timeout that races the downstream response.
async fn forward_with_timeout(
    shared: &Arc<RelayShared>,
    call: &ToolCall,
    decision: &Decision,
    raw: RawJsonRpcMessage,
    child_tx: &mpsc::Sender<Vec<u8>>,
    client_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    {
        let mut pending = shared.pending.lock().await;
        pending.insert(
            call.id.clone(),
            PendingReply {
                sequence_number: decision.sequence_number,
                host: call.context.host.clone(),
            },
        );
    }

    child_tx
        .send(raw.forward_bytes())
        .await
        .map_err(|_| anyhow::anyhow!("downstream channel closed"))?;

    let shared = Arc::clone(shared);
    let client_tx = client_tx.clone();
    let id = call.id.clone();
    let mut shutdown_rx = shared.shutdown.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(shared.forward_timeout) => {}
            _ = shutdown_rx.changed() => return,
        }
        let expired = shared.pending.lock().await.remove(&id);
        let Some(entry) = expired else {
            return; // reply won the race
        };
        shared.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(seq = entry.sequence_number, host = %entry.host, "downstream reply timed out");

        let now = chrono::Utc::now().timestamp_millis();
        if let Err(e) = shared.sentinel.record_response(
            entry.sequence_number,
            &entry.host,
            ResponseStatus::Timeout,
            None,
            now,
        ) {
            error!("failed to record timeout: {e:#}");
        }
        let reply = make_request_timeout(&id);
        let _ = client_tx.send(serialize_message(&reply)).await;
    });

    Ok(())
}

/// Process one message from the downstream server.
pub(crate) async fn handle_downstream_message(
    shared: &Arc<RelayShared>,
    raw: RawJsonRpcMessage,
    client_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    if let JsonRpcMessage::Response(response) = &raw.parsed {
        let entry = shared.pending.lock().await.remove(&response.id);
        if let Some(entry) = entry {
            let (status, message) = match &response.error {
                Some(err) => (ResponseStatus::Error, Some(err.message.clone())),
                None => (ResponseStatus::Success, None),
            };
            let now = chrono::Utc::now().timestamp_millis();
            shared.sentinel.record_response(
                entry.sequence_number,
                &entry.host,
                status,
                message.as_deref(),
                now,
            )?;
            debug!(seq = entry.sequence_number, status = %status.as_str(), "reply correlated");
        }
    }

    // Relay the original bytes either way; uncorrelated traffic (server
    // notifications, late replies) flows through untouched.
    client_tx
        .send(raw.forward_bytes())
        .await
        .map_err(|_| anyhow::anyhow!("client channel closed"))?;
    Ok(())
}

/// Fail every pending forward after the downstream disappears.
async fn fail_all_pending(shared: &Arc<RelayShared>, client_tx: &mpsc::Sender<Vec<u8>>) {
    let drained: Vec<(RequestId, PendingReply)> =
        shared.pending.lock().await.drain().collect();
    if drained.is_empty() {
        return;
    }
    warn!(count = drained.len(), "failing pending requests: downstream disconnected");
    let now = chrono::Utc::now().timestamp_millis();
    for (id, entry) in drained {
        if let Err(e) = shared.sentinel.record_response(
            entry.sequence_number,
            &entry.host,
            ResponseStatus::Error,
            Some("disconnected"),
            now,
        ) {
            error!("failed to record disconnect: {e:#}");
        }
        let reply = make_internal_error(&id, "Downstream disconnected");
        let _ = client_tx.send(serialize_message(&reply)).await;
    }
}

fn risk_data(verdict: &toolwarden_core::policy::PolicyVerdict) -> Value {
    json!({
        "reason": verdict.reason,
        "riskScore": verdict.risk_score,
        "riskFactors": verdict
            .risk_factors
            .iter()
            .map(|f| json!({"factor": f.factor, "score": f.score, "details": f.details}))
            .collect::<Vec<_>>(),
    })
}

fn make_policy_violation(id: &RequestId, verdict: &toolwarden_core::policy::PolicyVerdict) -> JsonRpcMessage {
    let mut data = risk_data(verdict);
    if let Some(retry_after) = verdict.retry_after_seconds {
        data["retryAfterSeconds"] = json!(retry_after);
    }
    JsonRpcMessage::Response(JsonRpcResponse::error_reply(
        id.clone(),
        POLICY_VIOLATION_CODE,
        "Policy violation",
        Some(data),
    ))
}

fn make_confirmation_required(
    id: &RequestId,
    verdict: &toolwarden_core::policy::PolicyVerdict,
) -> JsonRpcMessage {
    let mut data = risk_data(verdict);
    data["confirmationToken"] = json!(verdict.confirmation_token);
    JsonRpcMessage::Response(JsonRpcResponse::error_reply(
        id.clone(),
        CONFIRMATION_REQUIRED_CODE,
        "Confirmation required",
        Some(data),
    ))
}

fn make_request_timeout(id: &RequestId) -> JsonRpcMessage {
    JsonRpcMessage::Response(JsonRpcResponse::error_reply(
        id.clone(),
        REQUEST_TIMEOUT_CODE,
        "Request timeout",
        None,
    ))
}

fn make_internal_error(id: &RequestId, message: &str) -> JsonRpcMessage {
    JsonRpcMessage::Response(JsonRpcResponse::error_reply(
        id.clone(),
        INTERNAL_ERROR_CODE,
        message,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolwarden_core::audit::query::AuditFilter;
    use toolwarden_core::audit::AuditVerdict;
    use toolwarden_core::config::{self, Mode};
    use toolwarden_core::policy::{rule, Rule, RuleAction};
    use toolwarden_core::sentinel::SentinelConfig;

    fn test_shared(forward_timeout: Duration) -> Arc<RelayShared> {
        let sentinel = Arc::new(Sentinel::in_memory(SentinelConfig::default()).unwrap());
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Arc::new(RelayShared {
            sentinel,
            pending: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(InterceptorMetrics::default()),
            forward_timeout,
            alert_webhook_url: None,
            http: reqwest::Client::new(),
            shutdown,
        })
    }

    fn raw(line: &str) -> RawJsonRpcMessage {
        let mut parser = StreamParser::new();
        parser.feed(line.as_bytes());
        parser.feed(b"\n");
        parser.next_raw_message().unwrap().unwrap()
    }

    fn tool_call_line(id: i64, tool: &str, host: &str) -> String {
        format!(
            r#"{{"jsonrpc":"2.0","id":{id},"method":"tools/call","params":{{"name":"{tool}","agent":"agent-1","arguments":{{"host":"{host}","path":"/tmp/x"}}}}}}"#
        )
    }

    fn channels() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (child_tx, child_rx) = mpsc::channel(64);
        let (client_tx, client_rx) = mpsc::channel(64);
        (child_tx, child_rx, client_tx, client_rx)
    }

    // -- context extraction --

    #[test]
    fn extracts_tool_host_agent() {
        let request: JsonRpcRequest =
            serde_json::from_str(&tool_call_line(1, "fleet_exec", "prod-1")).unwrap();
        let call = extract_tool_call(&request).unwrap();
        assert_eq!(call.context.tool, "fleet_exec");
        assert_eq!(call.context.host, "prod-1");
        assert_eq!(call.context.agent, "agent-1");
        assert_eq!(call.id, RequestId::Int(1));
    }

    #[test]
    fn missing_host_and_agent_use_defaults() {
        let request: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"t","arguments":{}}}"#,
        )
        .unwrap();
        let call = extract_tool_call(&request).unwrap();
        assert_eq!(call.context.host, "local");
        assert_eq!(call.context.agent, "unknown");
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let request: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"t"}}"#,
        )
        .unwrap();
        let call = extract_tool_call(&request).unwrap();
        assert_eq!(call.context.arguments, json!({}));
    }

    #[test]
    fn confirmation_token_is_lifted_out_of_arguments() {
        let request: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"t","arguments":{"host":"h","confirmation_token":"tok-1"}}}"#,
        )
        .unwrap();
        let call = extract_tool_call(&request).unwrap();
        assert_eq!(call.context.confirmation_token.as_deref(), Some("tok-1"));
        assert!(call.context.arguments.get("confirmation_token").is_none());

        // Camel-case spelling works too.
        let request: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"t","arguments":{"confirmationToken":"tok-2"}}}"#,
        )
        .unwrap();
        let call = extract_tool_call(&request).unwrap();
        assert_eq!(call.context.confirmation_token.as_deref(), Some("tok-2"));
    }

    #[test]
    fn non_tool_call_methods_are_not_extracted() {
        let request: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
                .unwrap();
        assert!(extract_tool_call(&request).is_none());

        let request: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"arguments":{}}}"#,
        )
        .unwrap();
        assert!(extract_tool_call(&request).is_none(), "missing name is not a tool call");
    }

    // -- client message handling --

    #[tokio::test]
    async fn non_tool_calls_pass_through_verbatim() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (child_tx, mut child_rx, client_tx, mut client_rx) = channels();

        let line = r#"{"jsonrpc":"2.0", "id":1,  "method":"initialize","params":{}}"#;
        handle_client_message(&shared, raw(line), &child_tx, &client_tx).await.unwrap();

        let forwarded = child_rx.try_recv().unwrap();
        assert_eq!(forwarded, format!("{line}\n").into_bytes(), "bytes must be unmodified");
        assert!(client_rx.try_recv().is_err());

        // Nothing was audited for a passthrough.
        let entries = shared.sentinel.query_audit(&AuditFilter::default()).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn allowed_tool_call_is_forwarded_and_audited() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (child_tx, mut child_rx, client_tx, mut client_rx) = channels();

        let line = tool_call_line(7, "read_file", "host-a");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();

        assert!(child_rx.try_recv().is_ok(), "allowed request reaches downstream");
        assert!(client_rx.try_recv().is_err(), "no synthetic reply for allowed");

        let entries = shared.sentinel.query_audit(&AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].verdict, AuditVerdict::Allowed);
        assert!(entries[0].response_status.is_none(), "write-ahead: status comes later");

        assert!(shared.pending.lock().await.contains_key(&RequestId::Int(7)));
    }

    #[tokio::test]
    async fn denied_tool_call_gets_policy_violation_reply() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        {
            let conn = shared.sentinel.store().conn();
            let mut deny = Rule::new("no-exec", 0, RuleAction::Deny);
            deny.tool_pattern = Some("*exec*".to_string());
            rule::insert(&conn, &deny).unwrap();
        }
        let (child_tx, mut child_rx, client_tx, mut client_rx) = channels();

        let line = tool_call_line(3, "fleet_exec", "host-a");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();

        assert!(child_rx.try_recv().is_err(), "denied request must not be forwarded");
        let reply: Value = serde_json::from_slice(&client_rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], POLICY_VIOLATION_CODE);
        assert_eq!(reply["error"]["message"], "Policy violation");
        assert!(reply["error"]["data"]["reason"].as_str().unwrap().contains("no-exec"));

        let entries = shared.sentinel.query_audit(&AuditFilter::default()).unwrap();
        assert_eq!(entries[0].verdict, AuditVerdict::Denied);
        assert_eq!(
            entries[0].response_status,
            Some(ResponseStatus::Error),
            "rejections settle their audit entry immediately"
        );
    }

    #[tokio::test]
    async fn ask_tool_call_returns_confirmation_token() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        config::set_mode(&shared.sentinel.store().conn(), Mode::Alert).unwrap();
        let (child_tx, mut child_rx, client_tx, mut client_rx) = channels();

        let line = tool_call_line(4, "write_file", "host-a");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();

        assert!(child_rx.try_recv().is_err());
        let reply: Value = serde_json::from_slice(&client_rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], CONFIRMATION_REQUIRED_CODE);
        assert_eq!(reply["error"]["message"], "Confirmation required");
        let token = reply["error"]["data"]["confirmationToken"].as_str().unwrap().to_string();

        // Retry with the token inside arguments: forwarded this time.
        let retry = format!(
            r#"{{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{{"name":"write_file","agent":"agent-1","arguments":{{"host":"host-a","path":"/tmp/x","confirmation_token":"{token}"}}}}}}"#
        );
        handle_client_message(&shared, raw(&retry), &child_tx, &client_tx).await.unwrap();
        assert!(child_rx.try_recv().is_ok(), "confirmed retry reaches downstream");
    }

    #[tokio::test]
    async fn downstream_success_reply_settles_pending_and_relays() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (child_tx, _child_rx, client_tx, mut client_rx) = channels();

        let line = tool_call_line(9, "read_file", "host-b");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();

        let reply_line = r#"{"jsonrpc":"2.0","id":9,"result":{"content":[]}}"#;
        handle_downstream_message(&shared, raw(reply_line), &client_tx).await.unwrap();

        let relayed = client_rx.try_recv().unwrap();
        assert_eq!(relayed, format!("{reply_line}\n").into_bytes());
        assert!(shared.pending.lock().await.is_empty());

        let entries = shared.sentinel.query_audit(&AuditFilter::default()).unwrap();
        assert_eq!(entries[0].response_status, Some(ResponseStatus::Success));
    }

    #[tokio::test]
    async fn downstream_error_reply_records_error_and_drives_breaker() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (child_tx, _child_rx, client_tx, mut client_rx) = channels();

        // Default breaker threshold is 2 consecutive failures.
        for id in [11, 12] {
            let line = tool_call_line(id, "read_file", "host-c");
            handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();
            let reply = format!(
                r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32050,"message":"boom"}}}}"#
            );
            handle_downstream_message(&shared, raw(&reply), &client_tx).await.unwrap();
            client_rx.try_recv().unwrap();
        }

        // Circuit is now open: the next call is denied without forwarding.
        let line = tool_call_line(13, "read_file", "host-c");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();
        let reply: Value = serde_json::from_slice(&client_rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], POLICY_VIOLATION_CODE);
        assert!(reply["error"]["data"]["reason"]
            .as_str()
            .unwrap()
            .contains("circuit breaker open"));
        assert!(reply["error"]["data"]["retryAfterSeconds"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn uncorrelated_downstream_traffic_is_relayed() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (_child_tx, _child_rx, client_tx, mut client_rx) = channels();

        let notif = r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"p":1}}"#;
        handle_downstream_message(&shared, raw(notif), &client_tx).await.unwrap();
        assert_eq!(client_rx.try_recv().unwrap(), format!("{notif}\n").into_bytes());

        let unknown_reply = r#"{"jsonrpc":"2.0","id":999,"result":{}}"#;
        handle_downstream_message(&shared, raw(unknown_reply), &client_tx).await.unwrap();
        assert!(client_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_synthesizes_error_and_marks_audit() {
        let shared = test_shared(Duration::from_millis(100));
        let (child_tx, _child_rx, client_tx, mut client_rx) = channels();

        let line = tool_call_line(21, "slow_tool", "host-d");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Let the spawned timeout task run.
        tokio::task::yield_now().await;

        let reply: Value = serde_json::from_slice(&client_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], 21);
        assert_eq!(reply["error"]["code"], REQUEST_TIMEOUT_CODE);
        assert_eq!(reply["error"]["message"], "Request timeout");

        let entries = shared.sentinel.query_audit(&AuditFilter::default()).unwrap();
        assert_eq!(entries[0].response_status, Some(ResponseStatus::Timeout));
        assert!(shared.pending.lock().await.is_empty());
        assert_eq!(shared.metrics.timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reply_after_settlement_is_still_relayed_but_not_recorded_twice() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (child_tx, _child_rx, client_tx, mut client_rx) = channels();

        let line = tool_call_line(31, "read_file", "host-e");
        handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();

        let reply_line = r#"{"jsonrpc":"2.0","id":31,"result":{}}"#;
        handle_downstream_message(&shared, raw(reply_line), &client_tx).await.unwrap();
        client_rx.try_recv().unwrap();

        // A duplicate reply is uncorrelated now; relayed, breaker untouched.
        handle_downstream_message(&shared, raw(reply_line), &client_tx).await.unwrap();
        assert!(client_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending() {
        let shared = test_shared(DEFAULT_FORWARD_TIMEOUT);
        let (child_tx, _child_rx, client_tx, mut client_rx) = channels();

        for id in [41, 42] {
            let line = tool_call_line(id, "read_file", "host-f");
            handle_client_message(&shared, raw(&line), &child_tx, &client_tx).await.unwrap();
        }
        fail_all_pending(&shared, &client_tx).await;

        let mut codes = Vec::new();
        while let Ok(bytes) = client_rx.try_recv() {
            let reply: Value = serde_json::from_slice(&bytes).unwrap();
            codes.push(reply["error"]["code"].as_i64().unwrap());
            assert_eq!(reply["error"]["message"], "Downstream disconnected");
        }
        assert_eq!(codes.len(), 2);
        assert!(shared.pending.lock().await.is_empty());

        let entries = shared.sentinel.query_audit(&AuditFilter::default()).unwrap();
        assert!(entries
            .iter()
            .all(|e| e.response_status == Some(ResponseStatus::Error)));
        assert!(entries
            .iter()
            .all(|e| e.error_message.as_deref() == Some("disconnected")));
    }
}
