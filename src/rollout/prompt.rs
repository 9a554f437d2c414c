//! Chat-format text for the turns injected between assistant generations.
//!
//! After a tool call the assistant turn is closed, a user turn carries the
//! observation (or the error), and a fresh assistant turn is opened so the
//! engine continues from an empty assistant message.

use serde::{Deserialize, Serialize};

/// Template pieces for observation and error turns.
///
/// `{action_turn}` and `{observation_turn}` in [`ChatTemplate::observation_prompt`]
/// are replaced with the round that issued the tool call and the index of the
/// resulting observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatTemplate {
    pub turn_end: String,
    pub user_start: String,
    pub assistant_start: String,
    /// Placeholder text the tokenizer maps to a single image-pad token.
    pub image_placeholder: String,
    pub observation_prompt: String,
    /// Appended after the error text of a failed tool call.
    pub error_prompt: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            turn_end: "<|im_end|>\n".into(),
            user_start: "<|im_start|>user\n".into(),
            assistant_start: "<|im_start|>assistant\n".into(),
            image_placeholder: "<|vision_start|><|image_pad|><|vision_end|>".into(),
            observation_prompt: "The region you grounded in turn {action_turn} is attached as \
observation_{observation_turn}: {image}\n\
Continue your reasoning. Ground another region if you need a closer look, otherwise \
give your final answer."
                .into(),
            error_prompt: "Fix the grounding call and try again, or give your final answer.".into(),
        }
    }
}

impl ChatTemplate {
    /// User turn carrying an image observation.
    pub fn observation_turn(&self, action_turn: usize, observation_turn: usize) -> String {
        let body = self
            .observation_prompt
            .replace("{action_turn}", &action_turn.to_string())
            .replace("{observation_turn}", &observation_turn.to_string())
            .replace("{image}", &self.image_placeholder);
        self.wrap_user(&body)
    }

    /// User turn reporting a tool failure.
    pub fn error_turn(&self, error: &str) -> String {
        let body = format!(
            "ERROR occurs during grounding. Error Information: {error}.\n{}",
            self.error_prompt
        );
        self.wrap_user(&body)
    }

    /// User turn carrying a text observation.
    pub fn text_turn(&self, text: &str) -> String {
        self.wrap_user(text)
    }

    fn wrap_user(&self, body: &str) -> String {
        format!(
            "{}{}{}{}{}",
            self.turn_end, self.user_start, body, self.turn_end, self.assistant_start
        )
    }
}
