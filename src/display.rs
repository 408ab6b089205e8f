//! Display sink: the observer seam for tool execution.
//!
//! Sinks watch tool calls, results, progress and summaries, and may gate
//! execution through [`DisplaySink::approve`]. All hooks except `approve`
//! are fire-and-forget. Sinks compose by wrapping.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Outcome of an interactive approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// Skip this one tool call and continue the loop.
    Deny,
    /// Approve this call and every later one without prompting again.
    ApproveAll,
    /// Terminate the whole loop.
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallRecord {
    pub provider: String,
    pub tool: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub total_calls: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_duration: Duration,
    pub calls: Vec<ToolCallRecord>,
}

#[async_trait]
pub trait DisplaySink: Send + Sync {
    async fn tool_call(&self, _provider: &str, _tool: &str, _args: &Value) {}

    async fn tool_result(&self, _value: &Value, _duration: Duration) {}

    async fn error(&self, _message: &str) {}

    async fn progress(&self, _message: &str) {}

    async fn summary(&self, _summary: &ExecutionSummary) {}

    async fn approve(&self, _provider: &str, _tool: &str, _args: &Value) -> ApprovalDecision {
        ApprovalDecision::Approve
    }
}

/// Sink that ignores everything; used in headless library contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl DisplaySink for NoopSink {}

/// Plain-text sink for non-interactive terminal runs. Emits no ANSI
/// sequences, so `NO_COLOR` and dumb terminals need no special casing.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessSink;

#[async_trait]
impl DisplaySink for HeadlessSink {
    async fn tool_call(&self, provider: &str, tool: &str, args: &Value) {
        println!("-> calling {provider}.{tool} {args}");
    }

    async fn tool_result(&self, value: &Value, duration: Duration) {
        let mut rendered = value.to_string();
        if rendered.chars().count() > 200 {
            rendered = rendered.chars().take(200).collect();
            rendered.push_str("...");
        }
        println!("<- done in {:.2}s: {rendered}", duration.as_secs_f64());
    }

    async fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    async fn progress(&self, message: &str) {
        println!("{message}");
    }

    async fn summary(&self, summary: &ExecutionSummary) {
        println!(
            "summary: {} calls, {} ok, {} failed, {:.2}s total",
            summary.total_calls,
            summary.successful,
            summary.failed,
            summary.total_duration.as_secs_f64()
        );
        for (index, call) in summary.calls.iter().enumerate() {
            let status = if call.success { "ok" } else { "failed" };
            println!(
                "  {}. {}.{} {} ({:.2}s)",
                index + 1,
                call.provider,
                call.tool,
                status,
                call.duration.as_secs_f64()
            );
        }
    }
}

/// Wrapper that stamps call durations and accumulates an execution
/// summary while forwarding every hook to the inner sink.
pub struct TimingSink {
    inner: Arc<dyn DisplaySink>,
    state: Mutex<TimingState>,
}

#[derive(Default)]
struct TimingState {
    pending: Option<(String, String, Instant)>,
    calls: Vec<ToolCallRecord>,
}

impl TimingSink {
    pub fn new(inner: Arc<dyn DisplaySink>) -> Self {
        Self {
            inner,
            state: Mutex::new(TimingState::default()),
        }
    }

    /// Snapshot of everything observed so far.
    pub async fn finish(&self) -> ExecutionSummary {
        let state = self.state.lock().await;
        let successful = state.calls.iter().filter(|c| c.success).count();
        ExecutionSummary {
            total_calls: state.calls.len(),
            successful,
            failed: state.calls.len() - successful,
            total_duration: state.calls.iter().map(|c| c.duration).sum(),
            calls: state.calls.clone(),
        }
    }
}

#[async_trait]
impl DisplaySink for TimingSink {
    async fn tool_call(&self, provider: &str, tool: &str, args: &Value) {
        {
            let mut state = self.state.lock().await;
            state.pending = Some((provider.to_string(), tool.to_string(), Instant::now()));
        }
        self.inner.tool_call(provider, tool, args).await;
    }

    async fn tool_result(&self, value: &Value, duration: Duration) {
        let measured = {
            let mut state = self.state.lock().await;
            match state.pending.take() {
                Some((provider, tool, started)) => {
                    let elapsed = started.elapsed();
                    state.calls.push(ToolCallRecord {
                        provider,
                        tool,
                        duration: elapsed,
                        success: true,
                        error: None,
                    });
                    elapsed
                }
                None => duration,
            }
        };
        self.inner.tool_result(value, measured).await;
    }

    async fn error(&self, message: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some((provider, tool, started)) = state.pending.take() {
                state.calls.push(ToolCallRecord {
                    provider,
                    tool,
                    duration: started.elapsed(),
                    success: false,
                    error: Some(message.to_string()),
                });
            }
        }
        self.inner.error(message).await;
    }

    async fn progress(&self, message: &str) {
        self.inner.progress(message).await;
    }

    async fn summary(&self, summary: &ExecutionSummary) {
        self.inner.summary(summary).await;
    }

    async fn approve(&self, provider: &str, tool: &str, args: &Value) -> ApprovalDecision {
        self.inner.approve(provider, tool, args).await
    }
}
