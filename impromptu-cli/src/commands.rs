//! Stdin line commands.

use anyhow::{bail, Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `/set <key> <json>`
    Set { key: String, value: Value },
    /// `/get <key>`
    Get(String),
    /// `/store`
    Store,
    /// `/role`
    Role,
    /// `/help`
    Help,
    /// Anything that is not a command is broadcast.
    Send(Value),
}

pub const HELP: &str = "\
/set <key> <json>   write a store value
/get <key>          read a store value
/store              print the whole store
/role               print this peer's role and id
/help               this text
anything else       broadcast (as JSON if it parses, else as a string)";

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(parse_value(line))));
    };

    let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();
    let command = match name {
        "set" => {
            let (key, raw) = args
                .split_once(char::is_whitespace)
                .context("usage: /set <key> <json>")?;
            let value = serde_json::from_str(raw.trim())
                .with_context(|| format!("value for {key} is not valid JSON"))?;
            Command::Set {
                key: key.to_string(),
                value,
            }
        }
        "get" if !args.is_empty() => Command::Get(args.to_string()),
        "get" => bail!("usage: /get <key>"),
        "store" => Command::Store,
        "role" => Command::Role,
        "help" => Command::Help,
        other => bail!("unknown command /{other}, try /help"),
    };
    Ok(Some(command))
}

fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blank_line() {
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn test_plain_text_is_sent_as_string() {
        assert_eq!(
            parse_command("hello there").unwrap(),
            Some(Command::Send(json!("hello there")))
        );
    }

    #[test]
    fn test_json_is_sent_as_json() {
        assert_eq!(
            parse_command(r#"{"x": 1}"#).unwrap(),
            Some(Command::Send(json!({"x": 1})))
        );
        assert_eq!(parse_command("42").unwrap(), Some(Command::Send(json!(42))));
    }

    #[test]
    fn test_set() {
        assert_eq!(
            parse_command(r#"/set color "red""#).unwrap(),
            Some(Command::Set {
                key: "color".to_string(),
                value: json!("red"),
            })
        );
        assert_eq!(
            parse_command("/set pos {\"x\": 1, \"y\": 2}").unwrap(),
            Some(Command::Set {
                key: "pos".to_string(),
                value: json!({"x": 1, "y": 2}),
            })
        );
    }

    #[test]
    fn test_set_rejects_bad_input() {
        assert!(parse_command("/set color").is_err());
        assert!(parse_command("/set color red").is_err());
    }

    #[test]
    fn test_other_commands() {
        assert_eq!(
            parse_command("/get color").unwrap(),
            Some(Command::Get("color".to_string()))
        );
        assert!(parse_command("/get").is_err());
        assert_eq!(parse_command("/store").unwrap(), Some(Command::Store));
        assert_eq!(parse_command("/role").unwrap(), Some(Command::Role));
        assert_eq!(parse_command("/help").unwrap(), Some(Command::Help));
        assert!(parse_command("/nope").is_err());
    }
}
