//! Tool: generate-monologue — A Pragmatic vs Creative internal dialogue
//! about a programming task.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::llm::{ChatMessage, LlmError, MessageClient, MessageRequest};
use crate::protocol::RequestHandlerExtra;
use crate::types::{McpError, McpResult, ToolCallResult, ToolDefinition};

pub const NAME: &str = "generate-monologue";

const DEFAULT_LINES: u32 = 100;
const MAX_LINES: u32 = 500;
const MAX_CONTEXT_CHARS: usize = 2000;
const MAX_TASK_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
struct RawArgs {
    lines: Option<f64>,
    #[serde(default)]
    context: Option<String>,
    task: String,
}

/// Validated arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct MonologueArgs {
    pub lines: u32,
    pub context: String,
    pub task: String,
}

impl MonologueArgs {
    pub fn parse(arguments: Option<Value>) -> McpResult<Self> {
        let raw: RawArgs = serde_json::from_value(arguments.unwrap_or_else(|| json!({})))
            .map_err(|e| McpError::InvalidParams(format!("Invalid arguments for {NAME}: {e}")))?;

        let lines = match raw.lines {
            None => DEFAULT_LINES,
            Some(lines) if lines.fract() != 0.0 => {
                return Err(invalid("lines must be an integer"));
            }
            Some(lines) if !(1.0..=MAX_LINES as f64).contains(&lines) => {
                return Err(invalid(&format!("lines must be between 1 and {MAX_LINES}")));
            }
            Some(lines) => lines as u32,
        };

        let context = raw.context.unwrap_or_default();
        if context.chars().count() > MAX_CONTEXT_CHARS {
            return Err(invalid(&format!(
                "context must be at most {MAX_CONTEXT_CHARS} characters"
            )));
        }

        let task_len = raw.task.chars().count();
        if task_len == 0 || task_len > MAX_TASK_CHARS {
            return Err(invalid(&format!(
                "task must be between 1 and {MAX_TASK_CHARS} characters"
            )));
        }

        Ok(Self {
            lines,
            context,
            task: raw.task,
        })
    }
}

fn invalid(reason: &str) -> McpError {
    McpError::InvalidParams(format!("Invalid arguments for {NAME}: {reason}"))
}

/// Return the tool definition for generate-monologue.
pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: NAME.to_string(),
        description: Some(
            "Generate a reflective internal monologue in the style of Pragmatic vs Creative thinker"
                .to_string(),
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "lines": {
                    "type": "number",
                    "description": "Number of lines in the monologue (default: 100)",
                    "default": DEFAULT_LINES
                },
                "context": {
                    "type": "string",
                    "description": "Current conversation context"
                },
                "task": {
                    "type": "string",
                    "description": "Description of the task to perform"
                }
            },
            "required": ["task"]
        }),
    }
}

pub fn system_prompt(lines: u32) -> String {
    format!(
        "You are two thinkers having an internal dialogue about programming.
Pragmatic is focused on functionality and efficiency.
Creative is obsessive about innovation and elegance.

STRICT RULES:
1. Generate EXACTLY {lines} numbered lines
2. Each line must start with [Pragmatic] or [Creative]
3. NO abstractions - be specific about the code
4. NO complete solutions - REFLECT and QUESTION
5. Mention specific files, functions, variables when relevant
6. Think about: edge cases, performance, maintainability, user experience
7. Debate simplicity vs functionality
8. Question every technical decision
9. NO repeated ideas - each line must add new value
10. End without a definitive conclusion - it's reflection, not decision"
    )
}

pub fn user_prompt(args: &MonologueArgs) -> String {
    let mut prompt = String::new();
    if !args.context.is_empty() {
        prompt.push_str(&format!("Previous context:\n{}\n\n", args.context));
    }
    prompt.push_str(&format!(
        "Current task: {}\n\nGenerate an internal monologue of EXACTLY {} numbered lines \
         where the two thinkers debate the best way to approach this task.",
        args.task, args.lines
    ));
    prompt
}

/// Execute the generate-monologue tool.
pub async fn execute(
    arguments: Option<Value>,
    client: &dyn MessageClient,
    llm: &LlmConfig,
    extra: Option<&RequestHandlerExtra>,
) -> McpResult<ToolCallResult> {
    let args = MonologueArgs::parse(arguments)?;
    let progress = extra.and_then(RequestHandlerExtra::progress_reporter);

    if let Some(progress) = &progress {
        if let Err(e) = progress
            .report(0.0, Some(1.0), Some("Generating monologue".to_string()))
            .await
        {
            tracing::debug!("Progress notification failed: {e}");
        }
    }

    let request = MessageRequest {
        model: llm.model.clone(),
        max_tokens: llm.max_tokens,
        temperature: Some(llm.temperature),
        system: Some(system_prompt(args.lines)),
        messages: vec![ChatMessage::user(user_prompt(&args))],
    };

    let completion = client.create_message(request);
    let outcome = match extra.map(|extra| extra.signal.clone()) {
        Some(signal) => tokio::select! {
            outcome = completion => outcome,
            reason = signal.aborted() => return Err(McpError::Cancelled(reason)),
        },
        None => completion.await,
    };

    let text = outcome.and_then(|response| {
        response
            .first_text()
            .map(str::to_string)
            .ok_or(LlmError::EmptyContent)
    });
    let result = match text {
        Ok(text) => ToolCallResult::text(text),
        Err(e) => {
            tracing::warn!("Monologue generation failed: {e}");
            ToolCallResult::error(format!("Error generating monologue: {e}"))
        }
    };

    if let Some(progress) = &progress {
        if let Err(e) = progress.report(1.0, Some(1.0), None).await {
            tracing::debug!("Progress notification failed: {e}");
        }
    }
    Ok(result)
}
