//! Redaction of secret values from agent output.
//!
//! Credentials are handed to sandboxed processes as environment variables.
//! Anything those processes print passes through a [`Redactor`] before it
//! reaches logs or subscribers.

/// Replaces known secret values with `[REDACTED:<name>]`.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// (name, value) pairs, longest value first so overlapping secrets
    /// are replaced whole.
    secrets: Vec<(String, String)>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secret. Empty values are ignored.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() || self.secrets.iter().any(|(_, v)| *v == value) {
            return;
        }
        self.secrets.push((name.into(), value));
        self.secrets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    }

    /// Builder form of [`Redactor::add`].
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, value);
        self
    }

    /// Redacts all known secret values from a string.
    pub fn redact(&self, text: &str) -> String {
        if !self.has_secrets() {
            return text.to_string();
        }
        let mut result = text.to_string();
        for (name, value) in &self.secrets {
            if result.contains(value.as_str()) {
                result = result.replace(value.as_str(), &format!("[REDACTED:{}]", name));
            }
        }
        result
    }

    /// Returns true if any secrets are registered.
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_registered_values() {
        let redactor = Redactor::new().with_secret("GROK_API_KEY", "xai-abc123");

        let line = redactor.redact("using key xai-abc123 for request");

        assert_eq!(line, "using key [REDACTED:GROK_API_KEY] for request");
    }

    #[test]
    fn longer_secrets_are_replaced_first() {
        let redactor = Redactor::new()
            .with_secret("SHORT", "abc")
            .with_secret("LONG", "abcdef");

        assert_eq!(redactor.redact("abcdef abc"), "[REDACTED:LONG] [REDACTED:SHORT]");
    }

    #[test]
    fn empty_values_are_ignored() {
        let redactor = Redactor::new().with_secret("EMPTY", "");

        assert!(!redactor.has_secrets());
        assert_eq!(redactor.redact("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn duplicate_values_are_registered_once() {
        let mut redactor = Redactor::new();
        redactor.add("A", "same");
        redactor.add("B", "same");

        assert_eq!(redactor.redact("same"), "[REDACTED:A]");
    }
}
