use serde::{Deserialize, Serialize};

use crate::core::prompt::format_prompt;

/// How the caller consumes a request's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestMode {
    /// The caller waits for one final, cleaned-up text.
    Blocking,
    /// The caller iterates progressively longer partial texts.
    Streaming,
}

/// A unit of work for the engine, as built by the caller.
///
/// Requests have no identity beyond their position in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Free-form description, only used in logs (e.g. "Quest analysis").
    #[serde(default)]
    pub label: String,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            label: String::new(),
        }
    }

    /// Build from the `(prompt, system_prompt)` pair callers usually hold.
    /// An empty system prompt counts as none.
    pub fn from_pair(prompt: &str, system_prompt: &str) -> Self {
        Self::new(prompt).with_system(system_prompt)
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        self.system_prompt = if system_prompt.is_empty() {
            None
        } else {
            Some(system_prompt)
        };
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The prompt in the engine's turn markup.
    pub fn formatted(&self) -> String {
        format_prompt(&self.prompt, self.system_prompt.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_system_prompt_is_none() {
        let request = PromptRequest::from_pair("Bonjour", "");
        assert_eq!(request.system_prompt, None);
        assert!(!request.formatted().contains("system"));
    }

    #[test]
    fn builder_sets_fields() {
        let request = PromptRequest::new("Combien de pièces ?")
            .with_system("Réponds seulement avec un nombre.")
            .labeled("Extract reward");
        assert_eq!(request.label, "Extract reward");
        assert!(request
            .formatted()
            .starts_with("<|im_start|>system\nRéponds seulement avec un nombre."));
    }

    #[test]
    fn deserializes_with_defaults() {
        let request: PromptRequest = ron::from_str(r#"(prompt: "Salut")"#).unwrap();
        assert_eq!(request, PromptRequest::new("Salut"));
    }
}
