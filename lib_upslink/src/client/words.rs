//! # Wire Line Codec
//!
//! The UPS server protocol is line-oriented ASCII: one request or response
//! per `\n`-terminated line, words separated by whitespace. A value that
//! contains spaces travels as a quoted word (`VAR ups ups.status "OB LB"`),
//! with `\` escaping embedded quotes and backslashes.
//!
//! `split` and `encode` are exact inverses over well-formed input; the
//! config file parser reuses `split` since the directive files follow the
//! same quoting rules.

use thiserror::Error;

/// Raised when a line cannot be tokenised.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    /// A quoted word was opened but the closing `"` never arrived.
    #[error("unterminated quoted word")]
    UnterminatedQuote,
    /// A `\` escape at the very end of the line escapes nothing.
    #[error("dangling escape at end of line")]
    DanglingEscape,
}

/// Split one protocol line into its words.
///
/// Words are separated by runs of spaces or tabs. A word beginning with
/// `"` runs to the matching close quote and may contain whitespace;
/// inside and outside quotes, `\` makes the next character literal.
pub fn split(line: &str) -> Result<Vec<String>, SplitError> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        // skip separators between words
        while matches!(chars.peek(), Some(' ') | Some('\t')) {
            chars.next();
        }

        let quoted = match chars.peek() {
            None => return Ok(words),
            Some('"') => {
                chars.next();
                true
            }
            Some(_) => false,
        };

        let mut word = String::new();
        let mut closed = !quoted;

        while let Some(ch) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    Some(esc) => word.push(esc),
                    None => return Err(SplitError::DanglingEscape),
                },
                '"' if quoted => {
                    closed = true;
                    break;
                }
                ' ' | '\t' if !quoted => break,
                _ => word.push(ch),
            }
        }

        if !closed {
            return Err(SplitError::UnterminatedQuote);
        }

        words.push(word);
    }
}

/// Encode words into one protocol line (without the trailing newline).
///
/// Inverse of [`split`]: a word containing whitespace, a quote, a
/// backslash, or nothing at all is wrapped in quotes with `"` and `\`
/// escaped, so it arrives at the peer as a single word.
pub fn encode(words: &[impl AsRef<str>]) -> String {
    let mut line = String::new();

    for word in words {
        let word = word.as_ref();

        if !line.is_empty() {
            line.push(' ');
        }

        let needs_quotes = word.is_empty()
            || word.contains(|c: char| c == ' ' || c == '\t' || c == '"' || c == '\\');

        if !needs_quotes {
            line.push_str(word);
            continue;
        }

        line.push('"');
        for ch in word.chars() {
            if ch == '"' || ch == '\\' {
                line.push('\\');
            }
            line.push(ch);
        }
        line.push('"');
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_words() {
        let words = split("VAR myups ups.status OL").unwrap();
        assert_eq!(words, vec!["VAR", "myups", "ups.status", "OL"]);
    }

    #[test]
    fn splits_quoted_value_with_spaces() {
        let words = split("VAR myups ups.status \"OB LB\"").unwrap();
        assert_eq!(words, vec!["VAR", "myups", "ups.status", "OB LB"]);
    }

    #[test]
    fn collapses_separator_runs() {
        let words = split("  NUMLOGINS \t myups   1 ").unwrap();
        assert_eq!(words, vec!["NUMLOGINS", "myups", "1"]);
    }

    #[test]
    fn escape_keeps_literal_quote() {
        let words = split(r#"SET VAR myups ups.id "say \"hi\"""#).unwrap();
        assert_eq!(words.last().unwrap(), "say \"hi\"");
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            split("VAR myups ups.status \"OB LB"),
            Err(SplitError::UnterminatedQuote)
        );
    }

    #[test]
    fn dangling_escape_is_an_error() {
        assert_eq!(split("oops \\"), Err(SplitError::DanglingEscape));
    }

    #[test]
    fn empty_line_is_no_words() {
        assert_eq!(split("").unwrap(), Vec::<String>::new());
        assert_eq!(split("   \t ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn encode_quotes_only_when_needed() {
        assert_eq!(encode(&["GET", "VAR", "myups", "ups.status"]), "GET VAR myups ups.status");
        assert_eq!(encode(&["PASSWORD", "top secret"]), "PASSWORD \"top secret\"");
        assert_eq!(encode(&["VAR", "myups", "ups.id", ""]), "VAR myups ups.id \"\"");
    }

    #[test]
    fn round_trips_server_responses() {
        for line in [
            "VAR myups ups.status \"OB LB\"",
            "NUMLOGINS myups 3",
            "BEGIN LIST VAR myups",
            "VAR myups ups.mfr \"Example Power, Inc.\"",
            "END LIST VAR myups",
        ] {
            let words = split(line).unwrap();
            assert_eq!(split(&encode(&words)).unwrap(), words);
        }
    }

    #[test]
    fn round_trips_awkward_words() {
        let words = vec!["a word".to_string(), "q\"uote".to_string(), "back\\slash".to_string()];
        assert_eq!(split(&encode(&words)).unwrap(), words);
    }
}
