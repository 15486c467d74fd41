//! Classification of model replies.
//!
//! The system prompt asks the model to answer timer requests with exactly
//! `{"time":<seconds>}`. Anything that is not that object alone, give or take
//! whitespace, is ordinary chat.

use std::sync::OnceLock;

use regex::Regex;

fn timer_directive() -> &'static Regex {
    static RE_TIMER: OnceLock<Regex> = OnceLock::new();
    RE_TIMER.get_or_init(|| Regex::new(r#"^\s*\{\s*"time"\s*:\s*(\d+)\s*\}\s*$"#).unwrap())
}

/// What a model reply asks the bot to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Schedule a timer for this many seconds.
    Timer { seconds: u64 },
    /// Relay the text as-is.
    PlainText(String),
}

/// Parses model replies into intents.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntentParser;

impl IntentParser {
    pub fn new() -> Self {
        Self
    }

    /// Classify a reply. Never fails: anything unrecognized is plain text.
    pub fn parse(&self, response: &str) -> Intent {
        let Some(captures) = timer_directive().captures(response) else {
            return Intent::PlainText(response.to_string());
        };

        match captures[1].parse::<u64>() {
            Ok(seconds) => Intent::Timer { seconds },
            Err(e) => {
                tracing::warn!(
                    "Timer directive {:?} has an unusable duration ({}), treating as text",
                    response,
                    e
                );
                Intent::PlainText(response.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Intent {
        IntentParser::new().parse(s)
    }

    #[test]
    fn test_exact_directive() {
        assert_eq!(parse(r#"{"time":900}"#), Intent::Timer { seconds: 900 });
    }

    #[test]
    fn test_directive_with_whitespace() {
        assert_eq!(parse("  {\"time\": 30}  "), Intent::Timer { seconds: 30 });
        assert_eq!(parse("\n{ \"time\" : 5 }\n"), Intent::Timer { seconds: 5 });
    }

    #[test]
    fn test_plain_chat() {
        assert_eq!(
            parse("I like pizza"),
            Intent::PlainText("I like pizza".to_string())
        );
    }

    #[test]
    fn test_directive_inside_prose_is_text() {
        assert_eq!(
            parse(r#"{"time":900} extra text"#),
            Intent::PlainText(r#"{"time":900} extra text"#.to_string())
        );
        assert!(matches!(
            parse(r#"Sure! {"time":60}"#),
            Intent::PlainText(_)
        ));
    }

    #[test]
    fn test_other_shapes_are_text() {
        for raw in [
            r#"{"time":-5}"#,
            r#"{"time":"900"}"#,
            r#"{"time":9.5}"#,
            r#"{"seconds":900}"#,
            r#"{"time":900,"label":"tea"}"#,
            r#"{"time":}"#,
            "",
        ] {
            assert_eq!(parse(raw), Intent::PlainText(raw.to_string()), "{raw}");
        }
    }

    #[test]
    fn test_overflowing_duration_degrades_to_text() {
        let raw = r#"{"time":99999999999999999999999}"#;
        assert_eq!(parse(raw), Intent::PlainText(raw.to_string()));
    }

    #[test]
    fn test_zero_is_a_directive() {
        assert_eq!(parse(r#"{"time":0}"#), Intent::Timer { seconds: 0 });
    }
}
