// ActionCommand: a workflow command embedded in a line of step output.
//
// Two spellings are understood: `::name key=value,key=value::data` and the
// older `##[name key=value;key=value]data`.

use std::collections::BTreeMap;

/// Prefix and separator of the current command syntax.
pub const COMMAND_KEY: &str = "::";

/// Prefix of the older command syntax.
pub const LEGACY_PREFIX: &str = "##[";

/// Escapes are undone in table order, so `%25` always comes last.
const DATA_ESCAPES: &[(&str, &str)] = &[("%0D", "\r"), ("%0A", "\n"), ("%25", "%")];

const PROPERTY_ESCAPES: &[(&str, &str)] = &[
    ("%0D", "\r"),
    ("%0A", "\n"),
    ("%3A", ":"),
    ("%2C", ","),
    ("%25", "%"),
];

const LEGACY_ESCAPES: &[(&str, &str)] = &[
    ("%3B", ";"),
    ("%0D", "\r"),
    ("%0A", "\n"),
    ("%5D", "]"),
    ("%25", "%"),
];

/// A parsed workflow command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCommand {
    /// Command name, e.g. `set-output` or `add-mask`.
    pub command: String,
    pub properties: BTreeMap<String, String>,
    pub data: String,
}

impl ActionCommand {
    /// Parse `line` if it holds a command. Ordinary output gives `None`.
    pub fn parse(line: &str) -> Option<ActionCommand> {
        let line = line.trim_start().trim_end_matches(|c: char| c == '\r' || c == '\n');
        Self::parse_current(line).or_else(|| Self::parse_legacy(line))
    }

    fn parse_current(line: &str) -> Option<ActionCommand> {
        let rest = line.strip_prefix(COMMAND_KEY)?;
        let (info, data) = rest.split_once(COMMAND_KEY)?;
        let (command, properties) = split_info(info)?;
        Some(ActionCommand {
            command: command.to_string(),
            properties: parse_properties(properties, ',', PROPERTY_ESCAPES),
            data: unescape(data, DATA_ESCAPES),
        })
    }

    fn parse_legacy(line: &str) -> Option<ActionCommand> {
        let rest = line.strip_prefix(LEGACY_PREFIX)?;
        let (info, data) = rest.split_once(']')?;
        let (command, properties) = split_info(info)?;
        Some(ActionCommand {
            command: command.to_string(),
            properties: parse_properties(properties, ';', LEGACY_ESCAPES),
            data: unescape(data, LEGACY_ESCAPES),
        })
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Command name and the raw property list that follows the first space.
fn split_info(info: &str) -> Option<(&str, &str)> {
    let (command, properties) = match info.split_once(' ') {
        Some((command, properties)) => (command, properties.trim()),
        None => (info, ""),
    };
    (!command.is_empty()).then_some((command, properties))
}

fn parse_properties(raw: &str, separator: char, escapes: &[(&str, &str)]) -> BTreeMap<String, String> {
    raw.split(separator)
        .filter_map(|entry| entry.trim().split_once('='))
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .map(|(key, value)| (key.to_string(), unescape(value, escapes)))
        .collect()
}

fn unescape(escaped: &str, escapes: &[(&str, &str)]) -> String {
    escapes
        .iter()
        .fold(escaped.to_string(), |text, &(token, replacement)| text.replace(token, replacement))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_properties_and_data() {
        let command = ActionCommand::parse("::error file=app.rs,line=10::something broke").unwrap();
        assert_eq!(command.command, "error");
        assert_eq!(command.property("file"), Some("app.rs"));
        assert_eq!(command.property("line"), Some("10"));
        assert_eq!(command.data, "something broke");
    }

    #[test]
    fn unescapes_data_and_properties() {
        let command = ActionCommand::parse("::set-output name=a%3Ab%2Cc::one%0Atwo%25%0D").unwrap();
        assert_eq!(command.property("name"), Some("a:b,c"));
        assert_eq!(command.data, "one\ntwo%\r");

        // an escaped percent sign is not unescaped a second time
        let command = ActionCommand::parse("::debug::100%253A").unwrap();
        assert_eq!(command.data, "100%3A");
    }

    #[test]
    fn parses_the_legacy_spelling() {
        let command = ActionCommand::parse("##[warning file=a.rs;line=5]careful%3B%5D").unwrap();
        assert_eq!(command.command, "warning");
        assert_eq!(command.property("line"), Some("5"));
        assert_eq!(command.data, "careful;]");
    }

    #[test]
    fn ordinary_output_is_not_a_command() {
        assert!(ActionCommand::parse("hello world").is_none());
        assert!(ActionCommand::parse("::no-separator").is_none());
        assert!(ActionCommand::parse(":: ::data").is_none());
        assert!(ActionCommand::parse("").is_none());
    }

    #[test]
    fn resume_token_parses_as_a_bare_command() {
        let command = ActionCommand::parse("::pause-here::\n").unwrap();
        assert_eq!(command.command, "pause-here");
        assert!(command.properties.is_empty());
        assert!(command.data.is_empty());
    }
}
