//! User-supplied log format templates
//!
//! A template is plain text with `%name(option=value,...)` placeholders, e.g.
//! `%time(format=%H:%M:%S) %level(case=upper) [%prefix] %message`. Invalid
//! placeholders and options fail at startup with a diagnostic naming the bad
//! token and listing what would have been valid.

use super::LogEvent;
use crate::error::{Result, RunError};
use std::{path::Path, time::Duration};

const PLACEHOLDERS: &[(&str, &[&str])] = &[
    ("time", &["format"]),
    ("level", &["case", "width"]),
    ("prefix", &[]),
    ("tf-path", &[]),
    ("tf-command", &[]),
    ("tf-command-args", &["sep"]),
    ("message", &[]),
    ("interval", &[]),
    ("literal", &["text"]),
];

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Literal(String),
    Placeholder { name: String, options: Vec<(String, String)> },
}

/// A parsed and validated custom log format.
#[derive(Clone, Debug)]
pub struct CustomFormat {
    tokens: Vec<Token>,
}

impl CustomFormat {
    /// Parses `template`, rejecting unknown placeholders and options.
    pub fn parse(template: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            // %% escapes a literal percent sign
            if chars.peek() == Some(&'%') {
                chars.next();
                literal.push('%');
                continue;
            }
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }

            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_lowercase() || c == '-' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }

            let valid = PLACEHOLDERS.iter().find(|(n, _)| *n == name).ok_or_else(|| {
                RunError::msg(format!(
                    "invalid log format placeholder %{name}; valid placeholders: {}",
                    PLACEHOLDERS.iter().map(|(n, _)| format!("%{n}")).collect::<Vec<_>>().join(", ")
                ))
            })?;

            let mut options = Vec::new();
            if chars.peek() == Some(&'(') {
                chars.next();
                let mut raw = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ')' {
                        closed = true;
                        break;
                    }
                    raw.push(c);
                }
                if !closed {
                    return Err(RunError::msg(format!(
                        "unterminated option list for placeholder %{name}"
                    )));
                }
                for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                    let (key, value) = part
                        .split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                        .ok_or_else(|| {
                            RunError::msg(format!(
                                "malformed option {part:?} for placeholder %{name}; expected option=value"
                            ))
                        })?;
                    if !valid.1.contains(&key.as_str()) {
                        return Err(RunError::msg(format!(
                            "invalid option {key:?} for placeholder %{name}; valid options: {}",
                            if valid.1.is_empty() {
                                "none".to_string()
                            } else {
                                valid.1.join(", ")
                            }
                        )));
                    }
                    options.push((key, value));
                }
            }
            tokens.push(Token::Placeholder { name, options });
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(Self { tokens })
    }

    /// Renders one event. `display_path` applies the run's path display mode.
    pub fn render(
        &self,
        event: &LogEvent,
        elapsed: Duration,
        display_path: &dyn Fn(&Path) -> String,
    ) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Placeholder { name, options } => {
                    let option = |key: &str| {
                        options.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
                    };
                    match name.as_str() {
                        "time" => {
                            let fmt = option("format").unwrap_or("%H:%M:%S%.3f");
                            out.push_str(&event.time.format(fmt).to_string());
                        }
                        "level" => {
                            let mut level = event.level.as_str().to_string();
                            match option("case") {
                                Some("upper") => level = level.to_uppercase(),
                                Some("lower") | None => {}
                                Some(_) => {}
                            }
                            if let Some(width) = option("width").and_then(|w| w.parse::<usize>().ok())
                            {
                                level = format!("{level:<width$}");
                            }
                            out.push_str(&level);
                        }
                        "prefix" => {
                            if let Some(prefix) = &event.prefix {
                                out.push_str(&display_path(prefix));
                            }
                        }
                        "tf-path" => out.push_str(event.engine_path.as_deref().unwrap_or("")),
                        "tf-command" => out.push_str(event.command.as_deref().unwrap_or("")),
                        "tf-command-args" => {
                            let sep = option("sep").unwrap_or(" ");
                            out.push_str(&event.args.join(sep));
                        }
                        "message" => out.push_str(&event.message),
                        "interval" => out.push_str(&format!("{:.1}", elapsed.as_secs_f64())),
                        "literal" => out.push_str(option("text").unwrap_or("")),
                        _ => unreachable!("placeholder validated at parse time"),
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::LogLevel;

    fn event() -> LogEvent {
        LogEvent::new(LogLevel::Info, "applied 3 resources")
            .with_prefix("/ws/app")
            .with_engine("terraform", "apply")
    }

    fn display(p: &Path) -> String {
        p.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn renders_placeholders() {
        let fmt = CustomFormat::parse("%level(case=upper) [%prefix] %tf-command: %message").unwrap();
        let line = fmt.render(&event(), Duration::from_secs(2), &display);
        assert_eq!(line, "INFO [app] apply: applied 3 resources");
    }

    #[test]
    fn escaped_percent_is_literal() {
        let fmt = CustomFormat::parse("100%% %message").unwrap();
        let line = fmt.render(&event(), Duration::ZERO, &display);
        assert_eq!(line, "100% applied 3 resources");
    }

    #[test]
    fn unknown_placeholder_fails_fast() {
        let err = CustomFormat::parse("%bogus").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("%bogus"), "{message}");
        assert!(message.contains("%message"), "{message}");
    }

    #[test]
    fn unknown_option_names_valid_ones() {
        let err = CustomFormat::parse("%level(style=loud)").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("style"), "{message}");
        assert!(message.contains("case"), "{message}");
    }

    #[test]
    fn unterminated_options_fail() {
        assert!(CustomFormat::parse("%time(format=%H").is_err());
    }

    #[test]
    fn interval_renders_seconds() {
        let fmt = CustomFormat::parse("%interval %message").unwrap();
        let line = fmt.render(&event(), Duration::from_millis(1500), &display);
        assert!(line.starts_with("1.5 "), "{line}");
    }
}
