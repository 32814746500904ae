//! Narrows assistant output to the text between two delimiter markers.

use regex::Regex;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Default)]
pub struct OutputExtractor {
    pattern: Option<Regex>,
}

impl OutputExtractor {
    /// Identity extractor.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn between(open: &str, close: &str) -> Result<Self> {
        if open.is_empty() || close.is_empty() {
            return Err(AgentError::Config(
                "response delimiters must not be empty".into(),
            ));
        }
        // Greedy prefix so the last opening marker wins, lazy body so the
        // first closing marker after it ends the capture.
        let pattern = format!(
            "(?s).*{}(.*?){}",
            regex::escape(open),
            regex::escape(close)
        );
        let pattern = Regex::new(&pattern)
            .map_err(|err| AgentError::Config(format!("invalid response delimiters: {err}")))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// Builds an extractor from a configured tag list, which must hold
    /// either nothing or exactly an opening and a closing marker.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Result<Self> {
        match tags {
            [] => Ok(Self::identity()),
            [open, close] => Self::between(open.as_ref(), close.as_ref()),
            other => Err(AgentError::Config(format!(
                "expected zero or two response delimiters, got {}",
                other.len()
            ))),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.pattern.is_none()
    }

    pub fn apply(&self, content: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return content.to_string();
        };
        pattern
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_answer() {
        let extractor = OutputExtractor::between("<answer>", "</answer>").unwrap();
        assert_eq!(
            extractor.apply("reasoning...<answer>42</answer>trailing"),
            "42"
        );
    }

    #[test]
    fn spans_newlines_and_prefers_last_opening_marker() {
        let extractor = OutputExtractor::between("<a>", "</a>").unwrap();
        let text = "<a>draft</a>\nmore thinking\n<a>line one\nline two</a><a>";
        assert_eq!(extractor.apply(text), "line one\nline two");
    }

    #[test]
    fn escapes_regex_metacharacters() {
        let extractor = OutputExtractor::between("[[", "]]").unwrap();
        assert_eq!(extractor.apply("x [[y.z]] w"), "y.z");
    }

    #[test]
    fn leaves_unmatched_content_unchanged() {
        let extractor = OutputExtractor::between("<answer>", "</answer>").unwrap();
        assert_eq!(extractor.apply("no tags here"), "no tags here");
        assert_eq!(extractor.apply("<answer>unterminated"), "<answer>unterminated");
    }

    #[test]
    fn extraction_is_idempotent() {
        let extractor = OutputExtractor::between("<answer>", "</answer>").unwrap();
        let once = extractor.apply("think <answer>final words</answer>");
        assert_eq!(extractor.apply(&once), once);
    }

    #[test]
    fn identity_passes_through() {
        let extractor = OutputExtractor::from_tags::<&str>(&[]).unwrap();
        assert!(extractor.is_identity());
        assert_eq!(extractor.apply("<answer>1</answer>"), "<answer>1</answer>");
    }

    #[test]
    fn rejects_single_delimiter() {
        let err = OutputExtractor::from_tags(&["<answer>"]).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(OutputExtractor::from_tags(&["a", "b", "c"]).is_err());
    }
}
