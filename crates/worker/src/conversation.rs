//! Conversation prompt rendering
//!
//! Turns a role-attributed turn history into the single prompt string the
//! model consumes, using a separator template. The separator that closes an
//! assistant turn is also what the decoder and the stream trimmer watch for.

use serde::{Deserialize, Serialize};
use shardchat_common::config::ConversationConfig;
use shardchat_common::{Result, ShardChatError};
use shardchat_proto::Turn;

const HUMAN_ASSISTANT_SYSTEM: &str = "A chat between a curious human and an artificial intelligence assistant. \
     The assistant gives helpful, detailed, and polite answers to the human's questions.";

const USER_ASSISTANT_SYSTEM: &str = "A chat between a curious user and an artificial intelligence assistant. \
     The assistant gives helpful, detailed, and polite answers to the user's questions.";

const VISION_SYSTEM: &str = "You are LLaVA, a large language and vision assistant trained by UW Madison WAIV Lab.\
     You are able to understand the visual content that the user provides, and assist the user with a variety of tasks using natural language.\
     Follow the instructions carefully and explain your answers in detail.";

/// How turns are separated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeparatorStyle {
    /// Every turn ends with the primary separator
    Single,

    /// Turns alternate between the primary and secondary separators
    Paired,
}

/// Separator template for rendering conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTemplate {
    pub system_preamble: String,

    /// (user role, assistant role)
    pub role_names: (String, String),

    pub separator_style: SeparatorStyle,

    pub primary_sep: String,

    #[serde(default)]
    pub secondary_sep: Option<String>,
}

impl ConversationTemplate {
    pub fn single(
        system_preamble: impl Into<String>,
        roles: (&str, &str),
        sep: impl Into<String>,
    ) -> Self {
        Self {
            system_preamble: system_preamble.into(),
            role_names: (roles.0.to_string(), roles.1.to_string()),
            separator_style: SeparatorStyle::Single,
            primary_sep: sep.into(),
            secondary_sep: None,
        }
    }

    pub fn paired(
        system_preamble: impl Into<String>,
        roles: (&str, &str),
        sep: impl Into<String>,
        sep2: impl Into<String>,
    ) -> Self {
        Self {
            system_preamble: system_preamble.into(),
            role_names: (roles.0.to_string(), roles.1.to_string()),
            separator_style: SeparatorStyle::Paired,
            primary_sep: sep.into(),
            secondary_sep: Some(sep2.into()),
        }
    }

    /// Look up a named preset
    pub fn preset(name: &str) -> Result<Self> {
        let template = match name {
            "default" | "v1" | "simple" => {
                Self::single(HUMAN_ASSISTANT_SYSTEM, ("Human", "Assistant"), "###")
            }
            "multimodal" => Self::single(VISION_SYSTEM, ("Human", "Assistant"), "###"),
            "llava_v1" => Self::paired(VISION_SYSTEM, ("USER", "ASSISTANT"), " ", "</s>"),
            "vicuna_v1_1" => Self::paired(USER_ASSISTANT_SYSTEM, ("USER", "ASSISTANT"), " ", "</s>"),
            "bair_v1" => Self::paired("BEGINNING OF CONVERSATION:", ("USER", "GPT"), " ", "</s>"),
            other => {
                return Err(ShardChatError::invalid_template(format!(
                    "unknown conversation template: {}",
                    other
                )))
            }
        };
        Ok(template)
    }

    pub fn user_role(&self) -> &str {
        &self.role_names.0
    }

    pub fn assistant_role(&self) -> &str {
        &self.role_names.1
    }

    /// Separators indexed by turn parity
    fn separators(&self) -> Result<[&str; 2]> {
        match self.separator_style {
            SeparatorStyle::Single => Ok([self.primary_sep.as_str(), self.primary_sep.as_str()]),
            SeparatorStyle::Paired => {
                let secondary = self.secondary_sep.as_deref().ok_or_else(|| {
                    ShardChatError::invalid_template("paired separator style requires a secondary separator")
                })?;
                Ok([self.primary_sep.as_str(), secondary])
            }
        }
    }
}

/// Output of rendering one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub prompt: String,

    /// Separator that closes the turn being generated
    pub response_end_signal: String,

    /// Text a training objective scores for each completed assistant turn
    pub supervised_spans: Vec<String>,
}

/// Renders turn histories with a fixed template.
#[derive(Debug, Clone)]
pub struct ConversationPromptBuilder {
    template: ConversationTemplate,
    space_part_of_next_word: bool,
}

impl ConversationPromptBuilder {
    pub fn new(template: ConversationTemplate) -> Self {
        Self {
            template,
            space_part_of_next_word: true,
        }
    }

    /// Builder for the configured preset
    pub fn from_config(config: &ConversationConfig) -> Result<Self> {
        let template = ConversationTemplate::preset(&config.template)?;
        Ok(Self::new(template).with_space_part_of_next_word(config.space_part_of_next_word))
    }

    /// When false, the prompt ends with a space and the continuation does not
    /// start with one.
    pub fn with_space_part_of_next_word(mut self, enabled: bool) -> Self {
        self.space_part_of_next_word = enabled;
        self
    }

    pub fn template(&self) -> &ConversationTemplate {
        &self.template
    }

    /// Whether `turn` is the open slot the model should fill.
    ///
    /// PAIRED templates also treat an empty message as open.
    pub fn is_open(&self, turn: &Turn) -> bool {
        match (&turn.message, self.template.separator_style) {
            (None, _) => true,
            (Some(message), SeparatorStyle::Paired) => message.is_empty(),
            (Some(_), SeparatorStyle::Single) => false,
        }
    }

    /// Render a turn history into a prompt.
    pub fn render(&self, turns: &[Turn]) -> Result<RenderedPrompt> {
        if turns.is_empty() {
            return Err(ShardChatError::invalid_conversation("conversation has no turns"));
        }
        if let Some(index) = turns[..turns.len() - 1].iter().position(|t| self.is_open(t)) {
            return Err(ShardChatError::invalid_conversation(format!(
                "turn {} has no message; only the last turn may be open",
                index
            )));
        }

        let seps = self.template.separators()?;
        let mut prompt = match self.template.separator_style {
            SeparatorStyle::Single => format!("{}\n\n{}", self.template.system_preamble, seps[0]),
            SeparatorStyle::Paired => format!("{}{}", self.template.system_preamble, seps[0]),
        };
        let mut supervised_spans = Vec::new();

        for (i, turn) in turns.iter().enumerate() {
            match turn.message.as_ref().filter(|_| !self.is_open(turn)) {
                Some(message) => {
                    let closing = match self.template.separator_style {
                        SeparatorStyle::Single => format!("\n{}", seps[0]),
                        SeparatorStyle::Paired => seps[i % 2].to_string(),
                    };
                    prompt.push_str(&format!(" {}: {}{}", turn.role, message, closing));

                    if turn.role == self.template.assistant_role() {
                        let lead = if self.space_part_of_next_word { " " } else { "" };
                        supervised_spans.push(format!("{}{}{}", lead, message, closing));
                    }
                }
                None => {
                    prompt.push_str(&format!(" {}:", turn.role));
                    if !self.space_part_of_next_word {
                        prompt.push(' ');
                    }
                }
            }
        }

        let response_end_signal = seps[(turns.len() - 1) % 2].to_string();

        Ok(RenderedPrompt {
            prompt,
            response_end_signal,
            supervised_spans,
        })
    }

    /// Convert question/answer pairs into alternating user/assistant turns.
    pub fn qas_to_turns(&self, qas: &[(String, Option<String>)]) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(qas.len() * 2);
        for (question, answer) in qas {
            turns.push(Turn::new(self.template.user_role(), question.clone()));
            turns.push(Turn {
                role: self.template.assistant_role().to_string(),
                message: answer.clone(),
            });
        }
        turns
    }

    pub fn qas_to_prompt(&self, qas: &[(String, Option<String>)]) -> Result<RenderedPrompt> {
        self.render(&self.qas_to_turns(qas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConversationPromptBuilder {
        ConversationPromptBuilder::new(ConversationTemplate::single("S", ("Human", "Assistant"), "###"))
    }

    #[test]
    fn test_single_style_prompt() {
        let turns = vec![Turn::new("Human", "Hi"), Turn::pending("Assistant")];

        let rendered = builder().render(&turns).unwrap();

        assert_eq!(rendered.prompt, "S\n\n### Human: Hi\n### Assistant:");
        assert_eq!(rendered.response_end_signal, "###");
        assert!(rendered.supervised_spans.is_empty());
    }

    #[test]
    fn test_trailing_space_when_space_not_part_of_next_word() {
        let turns = vec![Turn::new("Human", "Hi"), Turn::pending("Assistant")];

        let rendered = builder().with_space_part_of_next_word(false).render(&turns).unwrap();

        assert!(rendered.prompt.ends_with(" Assistant: "));
    }

    #[test]
    fn test_multi_turn_signal_after_every_assistant_turn() {
        let turns = vec![
            Turn::new("Human", "Hi"),
            Turn::new("Assistant", "Hello!"),
            Turn::new("Human", "How are you?"),
            Turn::pending("Assistant"),
        ];

        let rendered = builder().render(&turns).unwrap();

        assert!(rendered.prompt.contains(" Assistant: Hello!\n###"));
        assert!(rendered.prompt.ends_with(" Assistant:"));
        assert_eq!(rendered.supervised_spans, vec![" Hello!\n###".to_string()]);

        let rendered = builder().with_space_part_of_next_word(false).render(&turns).unwrap();
        assert_eq!(rendered.supervised_spans, vec!["Hello!\n###".to_string()]);
    }

    #[test]
    fn test_paired_style_alternates_separators() {
        let template = ConversationTemplate::paired("SYS", ("USER", "ASSISTANT"), " ", "</s>");
        let turns = vec![
            Turn::new("USER", "Hi"),
            Turn::new("ASSISTANT", "Hello"),
            Turn::new("USER", "Bye"),
            Turn::pending("ASSISTANT"),
        ];

        let rendered = ConversationPromptBuilder::new(template).render(&turns).unwrap();

        assert_eq!(rendered.prompt, "SYS  USER: Hi  ASSISTANT: Hello</s> USER: Bye  ASSISTANT:");
        assert_eq!(rendered.response_end_signal, "</s>");
        assert_eq!(rendered.supervised_spans, vec![" Hello</s>".to_string()]);
    }

    #[test]
    fn test_paired_empty_message_is_open() {
        let builder =
            ConversationPromptBuilder::new(ConversationTemplate::paired("SYS", ("USER", "ASSISTANT"), " ", "</s>"));

        let rendered = builder
            .render(&[Turn::new("USER", "Hi"), Turn::new("ASSISTANT", "")])
            .unwrap();
        assert_eq!(rendered.prompt, "SYS  USER: Hi  ASSISTANT:");
        assert!(rendered.supervised_spans.is_empty());

        let err = builder
            .render(&[Turn::new("USER", ""), Turn::pending("ASSISTANT")])
            .unwrap_err();
        assert!(matches!(err, ShardChatError::InvalidConversation(_)));
    }

    #[test]
    fn test_single_empty_message_is_rendered() {
        let rendered = builder()
            .render(&[Turn::new("Human", ""), Turn::pending("Assistant")])
            .unwrap();

        assert_eq!(rendered.prompt, "S\n\n### Human: \n### Assistant:");
    }

    #[test]
    fn test_paired_without_secondary_separator_is_invalid_template() {
        let mut template = ConversationTemplate::paired("SYS", ("USER", "ASSISTANT"), " ", "</s>");
        template.secondary_sep = None;
        let turns = vec![Turn::new("USER", "Hi"), Turn::pending("ASSISTANT")];

        let err = ConversationPromptBuilder::new(template).render(&turns).unwrap_err();

        assert!(matches!(err, ShardChatError::InvalidTemplate(_)));
    }

    #[test]
    fn test_empty_and_open_middle_turns_are_rejected() {
        let err = builder().render(&[]).unwrap_err();
        assert!(matches!(err, ShardChatError::InvalidConversation(_)));

        let turns = vec![Turn::pending("Human"), Turn::pending("Assistant")];
        let err = builder().render(&turns).unwrap_err();
        assert!(matches!(err, ShardChatError::InvalidConversation(_)));
    }

    #[test]
    fn test_qas_to_prompt_uses_template_roles() {
        let builder = ConversationPromptBuilder::new(ConversationTemplate::preset("default").unwrap());
        let qas = vec![
            ("What is this?".to_string(), Some("A cat.".to_string())),
            ("Its color?".to_string(), None),
        ];

        let rendered = builder.qas_to_prompt(&qas).unwrap();

        assert!(rendered.prompt.starts_with("A chat between a curious human"));
        assert!(rendered.prompt.contains("### Human: What is this?\n### Assistant: A cat.\n###"));
        assert!(rendered.prompt.ends_with("### Human: Its color?\n### Assistant:"));
    }

    #[test]
    fn test_presets() {
        let vicuna = ConversationTemplate::preset("vicuna_v1_1").unwrap();
        assert_eq!(vicuna.separator_style, SeparatorStyle::Paired);
        assert_eq!(vicuna.secondary_sep.as_deref(), Some("</s>"));
        assert_eq!(ConversationTemplate::preset("bair_v1").unwrap().assistant_role(), "GPT");

        let err = ConversationTemplate::preset("chatml").unwrap_err();
        assert!(matches!(err, ShardChatError::InvalidTemplate(_)));
    }

    #[test]
    fn test_template_from_json() {
        let raw = r#"{
            "system_preamble": "S",
            "role_names": ["USER", "ASSISTANT"],
            "separator_style": "paired",
            "primary_sep": " ",
            "secondary_sep": "</s>"
        }"#;
        let template: ConversationTemplate = serde_json::from_str(raw).unwrap();

        assert_eq!(template, ConversationTemplate::paired("S", ("USER", "ASSISTANT"), " ", "</s>"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let turns = vec![Turn::new("Human", "Hi"), Turn::pending("Assistant")];
        assert_eq!(builder().render(&turns).unwrap(), builder().render(&turns).unwrap());
    }
}
