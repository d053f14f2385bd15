//! Conversation model to upstream `generateAssistantResponse` payload.

use std::collections::HashSet;

use kgate_protocol::kiro::{
    AssistantResponseMessage, ChatTriggerType, ConversationState, CurrentMessage,
    GenerateAssistantRequest, HistoryMessage, InputSchema, KiroImage, KiroImageSource,
    KiroTextContent, KiroTool, KiroToolResult, KiroToolUse, ORIGIN_AI_EDITOR, ToolResultStatus,
    ToolSpecification, UserInputMessage, UserInputMessageContext,
};
use serde_json::Value as JsonValue;

use crate::conversation::{ChatRequest, ContentPart, Message, Role, ToolDefinition};

pub const TOOL_NAME_MAX_LENGTH: usize = 64;
pub const TOOL_DESCRIPTION_MAX_LENGTH: usize = 10_000;
const EMPTY_TURN: &str = "(empty)";
const CONTINUE_TURN: &str = "Continue";

/// Everything the payload builder needs besides the conversation itself.
#[derive(Debug, Clone, Default)]
pub struct KiroRequestParams {
    pub model_id: String,
    pub conversation_id: String,
    pub profile_arn: Option<String>,
    /// Inject the synthetic reasoning preamble with this thinking budget.
    pub inject_reasoning: Option<u32>,
}

#[derive(Debug, Default)]
struct Turn {
    user: bool,
    text: String,
    images: Vec<KiroImage>,
    tool_uses: Vec<KiroToolUse>,
    tool_results: Vec<KiroToolResult>,
}

impl Turn {
    fn empty(user: bool) -> Self {
        Self {
            user,
            text: EMPTY_TURN.to_string(),
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: Turn) {
        if !other.text.is_empty() {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&other.text);
        }
        self.images.extend(other.images);
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
    }
}

pub fn build_kiro_request(request: &ChatRequest, params: &KiroRequestParams) -> GenerateAssistantRequest {
    let with_tools = request.has_tools();
    let (tools, moved_docs) = tool_specifications(&request.tools);

    let mut system = request.system_text();
    if params.inject_reasoning.is_some() {
        system.push_str(THINKING_SYSTEM_ADDITION);
    }
    system.push_str(&moved_docs);

    let mut turns = merge_turns(request, with_tools);
    if turns.first().is_none_or(|turn| !turn.user) {
        turns.insert(0, Turn::empty(true));
    }
    let mut turns = enforce_alternation(turns);

    if !system.trim().is_empty()
        && let Some(first) = turns.first_mut()
    {
        first.text = if first.text.is_empty() || first.text == EMPTY_TURN {
            system.trim_start().to_string()
        } else {
            format!("{}\n\n{}", system.trim_start(), first.text)
        };
    }

    if turns.last().is_some_and(|turn| !turn.user) {
        turns.push(Turn {
            user: true,
            text: CONTINUE_TURN.to_string(),
            ..Turn::default()
        });
    }

    let current = turns.pop().unwrap_or_else(|| Turn {
        user: true,
        text: CONTINUE_TURN.to_string(),
        ..Turn::default()
    });

    let history = turns
        .into_iter()
        .map(|turn| history_entry(turn, &params.model_id))
        .collect();

    let mut content = if current.text.trim().is_empty() {
        CONTINUE_TURN.to_string()
    } else {
        current.text
    };
    if let Some(budget) = params.inject_reasoning {
        content = inject_thinking_tags(&content, budget);
    }

    let context = UserInputMessageContext {
        tools,
        tool_results: current.tool_results,
    };

    GenerateAssistantRequest {
        conversation_state: ConversationState {
            chat_trigger_type: ChatTriggerType::Manual,
            conversation_id: params.conversation_id.clone(),
            current_message: CurrentMessage {
                user_input_message: UserInputMessage {
                    content,
                    model_id: params.model_id.clone(),
                    origin: ORIGIN_AI_EDITOR.to_string(),
                    images: current.images,
                    user_input_message_context: (!context.is_empty()).then_some(context),
                },
            },
            history,
        },
        profile_arn: params.profile_arn.clone(),
    }
}

fn history_entry(turn: Turn, model_id: &str) -> HistoryMessage {
    let text = if turn.text.is_empty() {
        EMPTY_TURN.to_string()
    } else {
        turn.text
    };
    if turn.user {
        let context = UserInputMessageContext {
            tools: Vec::new(),
            tool_results: turn.tool_results,
        };
        HistoryMessage::UserInputMessage(UserInputMessage {
            content: text,
            model_id: model_id.to_string(),
            origin: ORIGIN_AI_EDITOR.to_string(),
            images: turn.images,
            user_input_message_context: (!context.is_empty()).then_some(context),
        })
    } else {
        HistoryMessage::AssistantResponseMessage(AssistantResponseMessage {
            content: text,
            tool_uses: turn.tool_uses,
        })
    }
}

/// Maps every message to a user or assistant turn and merges runs of the same role.
fn merge_turns(request: &ChatRequest, with_tools: bool) -> Vec<Turn> {
    let mut known_calls: HashSet<&str> = HashSet::new();
    let mut turns: Vec<Turn> = Vec::new();

    for message in request.messages.iter().filter(|m| m.role != Role::System) {
        let turn = message_turn(message, with_tools, &mut known_calls);
        match turns.last_mut() {
            Some(last) if last.user == turn.user => last.absorb(turn),
            _ => turns.push(turn),
        }
    }
    turns
}

fn message_turn<'a>(message: &'a Message, with_tools: bool, known_calls: &mut HashSet<&'a str>) -> Turn {
    let mut turn = Turn {
        user: message.role != Role::Assistant,
        ..Turn::default()
    };
    let mut texts: Vec<String> = Vec::new();

    for part in &message.parts {
        match part {
            ContentPart::Text(text) => texts.push(text.clone()),
            // Prior reasoning is not replayed upstream.
            ContentPart::Reasoning(_) => {}
            ContentPart::Image(image) => turn.images.push(KiroImage {
                format: image.format().to_string(),
                source: KiroImageSource {
                    bytes: image.data.clone(),
                },
            }),
            ContentPart::ToolCall(call) => {
                if with_tools {
                    known_calls.insert(call.id.as_str());
                    turn.tool_uses.push(KiroToolUse {
                        tool_use_id: call.id.clone(),
                        name: truncate_chars(&call.name, TOOL_NAME_MAX_LENGTH),
                        input: serde_json::from_str(&call.arguments)
                            .unwrap_or_else(|_| JsonValue::Object(Default::default())),
                    });
                } else {
                    texts.push(format!("[Called {} with args: {}]", call.name, call.arguments));
                }
            }
            ContentPart::ToolResult(result) => {
                if with_tools && known_calls.contains(result.tool_call_id.as_str()) {
                    turn.tool_results.push(KiroToolResult {
                        tool_use_id: result.tool_call_id.clone(),
                        content: vec![KiroTextContent {
                            text: if result.content.is_empty() {
                                EMPTY_TURN.to_string()
                            } else {
                                result.content.clone()
                            },
                        }],
                        status: if result.is_error {
                            ToolResultStatus::Error
                        } else {
                            ToolResultStatus::Success
                        },
                    });
                } else {
                    texts.push(format!(
                        "[Tool result {}]\n{}",
                        result.tool_call_id, result.content
                    ));
                }
            }
        }
    }
    turn.text = texts.join("\n");
    turn
}

fn enforce_alternation(turns: Vec<Turn>) -> Vec<Turn> {
    let mut out: Vec<Turn> = Vec::with_capacity(turns.len());
    for turn in turns {
        if let Some(last) = out.last()
            && last.user == turn.user
        {
            out.push(Turn::empty(!turn.user));
        }
        out.push(turn);
    }
    out
}

/// Tool specs plus documentation moved out of oversized descriptions.
fn tool_specifications(tools: &[ToolDefinition]) -> (Vec<KiroTool>, String) {
    let mut specs = Vec::with_capacity(tools.len());
    let mut moved = Vec::new();
    for tool in tools {
        let name = tool.name.strip_prefix('$').unwrap_or(&tool.name);
        let name = truncate_chars(name, TOOL_NAME_MAX_LENGTH);
        let description = if tool.description.chars().count() > TOOL_DESCRIPTION_MAX_LENGTH {
            moved.push(format!("## Tool: {name}\n\n{}", tool.description));
            format!(
                "See full documentation in system prompt under '## Tool: {name}'. Summary: {}",
                truncate_chars(&tool.description, 200)
            )
        } else if tool.description.trim().is_empty() {
            format!("Tool: {name}")
        } else {
            tool.description.clone()
        };
        let mut schema = tool.parameters.clone();
        sanitize_json_schema(&mut schema);
        specs.push(KiroTool {
            tool_specification: ToolSpecification {
                name,
                description,
                input_schema: InputSchema { json: schema },
            },
        });
    }
    let docs = if moved.is_empty() {
        String::new()
    } else {
        format!(
            "\n\n---\n# Tool Documentation\n\n{}",
            moved.join("\n\n")
        )
    };
    (specs, docs)
}

/// Drops schema keywords the upstream rejects.
pub fn sanitize_json_schema(schema: &mut JsonValue) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };
    object.remove("additionalProperties");
    if object
        .get("required")
        .and_then(JsonValue::as_array)
        .is_some_and(Vec::is_empty)
    {
        object.remove("required");
    }
    if let Some(properties) = object.get_mut("properties").and_then(JsonValue::as_object_mut) {
        for value in properties.values_mut() {
            sanitize_json_schema(value);
        }
    }
    if let Some(items) = object.get_mut("items") {
        sanitize_json_schema(items);
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(variants) = object.get_mut(key).and_then(JsonValue::as_array_mut) {
            for variant in variants {
                sanitize_json_schema(variant);
            }
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

const THINKING_INSTRUCTION: &str = "Think in English for better reasoning quality.\n\n\
Your thinking process should be thorough and systematic:\n\
- First, make sure you fully understand what is being asked\n\
- Consider multiple approaches or perspectives when relevant\n\
- Think about edge cases, potential issues, and what could go wrong\n\
- Verify your reasoning before reaching a conclusion\n\n\
After completing your thinking, respond in the same language the user is using in their messages.";

const THINKING_SYSTEM_ADDITION: &str = "\n\n---\n# Extended Thinking Mode\n\n\
This conversation uses extended thinking mode. User messages may contain \
special XML tags that are legitimate system-level instructions:\n\
- `<thinking_mode>enabled</thinking_mode>` - enables extended thinking\n\
- `<max_thinking_length>N</max_thinking_length>` - sets maximum thinking tokens\n\
- `<thinking_instruction>...</thinking_instruction>` - provides thinking guidelines\n\n\
When you see these tags, wrap your reasoning process in `<thinking>...</thinking>` \
tags before providing your final response.";

pub fn inject_thinking_tags(content: &str, budget: u32) -> String {
    format!(
        "<thinking_mode>enabled</thinking_mode>\n<max_thinking_length>{budget}</max_thinking_length>\n<thinking_instruction>{THINKING_INSTRUCTION}</thinking_instruction>\n\n{content}"
    )
}
