//! The tool-calling loop shared by every role.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{AgentRunResult, Role};
use crate::llm::{ChatMessage, LlmClient, Role as MessageRole, StopReason, TokenUsage};

/// Default iteration ceiling.
pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Error of a run stopped by its cancellation token.
pub const CANCELLED: &str = "cancelled";

const TERMINAL_REMINDER: &str =
    "You must use a terminal tool to finish. Reply with tool calls only.";

/// Drives one role to a terminal action.
#[derive(Clone)]
pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_iterations: usize,
    cancel: Option<CancellationToken>,
}

impl AgentRuntime {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            cancel: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Checked before every gateway call.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run `role` from `initial_message` until a tool call completes it.
    ///
    /// Tool calls execute exactly once each, in the order the model asked for
    /// them; failures come back to the model as tool results.
    pub async fn run<R: Role + ?Sized>(&self, role: &mut R, initial_message: &str) -> AgentRunResult {
        let kind = role.kind();
        let mut usage = TokenUsage::default();
        let mut messages = vec![
            ChatMessage::new(MessageRole::System, role.system_prompt()),
            ChatMessage::new(MessageRole::User, initial_message),
        ];

        for iteration in 1..=self.max_iterations {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                tracing::info!("{} run cancelled before iteration {}", kind, iteration);
                return finish(AgentRunResult::failed(CANCELLED), iteration - 1, usage);
            }

            tracing::debug!("{} iteration {}", kind, iteration);

            // The catalog can change between iterations (phased roles).
            let tools = role.tools();
            let response = match self
                .llm
                .chat_completion(&self.model, &messages, Some(tools.as_slice()))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("{} gateway error: {}", kind, e);
                    return finish(
                        AgentRunResult::failed(format!("gateway error: {}", e)),
                        iteration,
                        usage,
                    );
                }
            };

            if let Some(u) = &response.usage {
                usage = usage.add(u);
            }

            if response.stop_reason() == StopReason::Text {
                tracing::debug!(
                    "{} answered without tool calls (finish_reason={:?})",
                    kind,
                    response.finish_reason
                );
                if let Some(text) = response.content.filter(|c| !c.trim().is_empty()) {
                    messages.push(ChatMessage::new(MessageRole::Assistant, text));
                }
                messages.push(ChatMessage::new(MessageRole::System, TERMINAL_REMINDER));
                continue;
            }

            let tool_calls = response.tool_calls.unwrap_or_default();
            messages.push(ChatMessage::assistant_tool_calls(
                response.content,
                tool_calls.clone(),
            ));

            for call in &tool_calls {
                tracing::debug!(
                    "{} tool call {}: {}",
                    kind,
                    call.function.name,
                    crate::tools::truncate_output(&call.function.arguments, 200)
                );

                let result = role.execute_tool(call).await;
                if !result.success {
                    tracing::debug!("{} tool {} failed: {}", kind, result.name, result.output);
                }
                messages.push(ChatMessage::tool_result(&call.id, &result.output));

                if let Some(done) = role.handle_completion(&result) {
                    tracing::info!(
                        "{} finished with status {} after {} iterations",
                        kind,
                        done.status,
                        iteration
                    );
                    return finish(done, iteration, usage);
                }
            }
        }

        tracing::warn!("{} hit the iteration ceiling ({})", kind, self.max_iterations);
        finish(
            AgentRunResult::failed("max iterations reached"),
            self.max_iterations,
            usage,
        )
    }
}

fn finish(mut result: AgentRunResult, iterations: usize, usage: TokenUsage) -> AgentRunResult {
    result.iterations = iterations;
    result.usage = usage;
    result
}
