//! Console command parsing for the `node` binary.
//!
//! This is separate from the peer wire protocol in [`crate::message`]:
//! `ConsoleCommand` is what an operator types, including meta-commands like
//! STATUS and EXIT that never leave the node.

use anyhow::{Result, anyhow};
use serde_json::Value;

/// Commands that can be entered at the console prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Get {
        query: String,
        values: Option<Vec<Value>>,
    },
    Post {
        query: String,
        values: Option<Vec<Value>>,
    },
    Status,
    Campaign,
    Exit,
    Help,
}

pub const HELP: &str = "\
Commands (case-insensitive, aliases in parentheses):
  GET <sql> [json-values]   (g)  read through a voting round, leader only
  POST <sql> [json-values]  (p)  replicate a write, leader only
  STATUS                    (s)  role, leader, peers, log id and timers
  CAMPAIGN                  (c)  start an election round now
  HELP                      (h)  show this text
  EXIT                      (e)  shut the node down
Example: POST INSERT INTO t (v) VALUES (?) [42]";

impl ConsoleCommand {
    /// Parses a line of operator input.
    ///
    /// The SQL keeps its original spelling. An optional trailing JSON array
    /// supplies the values bound to `?` placeholders.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };

        let cmd = word.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "G" => "GET",
            "P" => "POST",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized_cmd, rest.is_empty()) {
            ("EXIT", true) => Ok(ConsoleCommand::Exit),
            ("HELP", true) => Ok(ConsoleCommand::Help),
            ("STATUS", true) => Ok(ConsoleCommand::Status),
            ("CAMPAIGN", true) => Ok(ConsoleCommand::Campaign),
            ("GET", false) => {
                let (query, values) = split_values(rest);
                Ok(ConsoleCommand::Get { query, values })
            }
            ("POST", false) => {
                let (query, values) = split_values(rest);
                Ok(ConsoleCommand::Post { query, values })
            }
            ("GET", true) => Err(anyhow!("GET requires a query: GET <sql> [json-values]")),
            ("POST", true) => Err(anyhow!("POST requires a query: POST <sql> [json-values]")),
            ("EXIT" | "HELP" | "STATUS" | "CAMPAIGN", false) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: GET/g <sql>, POST/p <sql> [values], STATUS/s, CAMPAIGN/c, HELP/h, EXIT/e"
            )),
        }
    }
}

/// Splits a trailing JSON array off `input`, if there is one.
fn split_values(input: &str) -> (String, Option<Vec<Value>>) {
    if input.ends_with(']') {
        for (start, _) in input.rmatch_indices('[') {
            if let Ok(values) = serde_json::from_str::<Vec<Value>>(&input[start..]) {
                let query = input[..start].trim();
                if !query.is_empty() {
                    return (query.to_string(), Some(values));
                }
            }
        }
    }
    (input.to_string(), None)
}
