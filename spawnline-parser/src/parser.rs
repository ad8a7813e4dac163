use crate::grammar::{ArgumentParser, Rule};
use pest::iterators::Pair;
use pest::Parser;
use spawnline_core::{Result, SpawnlineError};

/// Split a pre-joined argument line into argv, undoing the escaping applied by the builder.
///
/// Lines joined without escaping are accepted too: a backslash that does not
/// start one of the six escapes stays a backslash, and a double quote with no
/// closing partner stays a double quote.
pub fn parse_argument_line(input: &str) -> Result<Vec<String>> {
    let mut pairs = ArgumentParser::parse(Rule::line, input)
        .map_err(|e| SpawnlineError::ParseError(format!("Invalid argument line: {}", e)))?;

    let line = pairs.next().ok_or_else(|| {
        SpawnlineError::ParseError("No argument line found in input".to_string())
    })?;

    let mut arguments = Vec::new();
    for pair in line.into_inner() {
        if pair.as_rule() == Rule::token {
            arguments.push(parse_token(pair)?);
        }
    }

    Ok(arguments)
}

/// Inverse of `escape_argument` for a single token
pub fn unescape_argument(input: &str) -> Result<String> {
    let mut pairs = ArgumentParser::parse(Rule::argument, input)
        .map_err(|e| SpawnlineError::ParseError(format!("Invalid escaped argument: {}", e)))?;

    let argument = pairs.next().ok_or_else(|| {
        SpawnlineError::ParseError("No argument found in input".to_string())
    })?;

    let mut value = String::with_capacity(input.len());
    for pair in argument.into_inner() {
        match pair.as_rule() {
            Rule::escape => value.push(parse_escape(pair)?),
            Rule::raw_text => value.push_str(pair.as_str()),
            _ => {}
        }
    }

    Ok(value)
}

fn parse_token(pair: Pair<Rule>) -> Result<String> {
    let mut value = String::new();

    for inner_pair in pair.into_inner() {
        match inner_pair.as_rule() {
            Rule::literal | Rule::lone => value.push_str(inner_pair.as_str()),
            Rule::escape => value.push(parse_escape(inner_pair)?),
            Rule::quoted => {
                for quoted_pair in inner_pair.into_inner() {
                    match quoted_pair.as_rule() {
                        Rule::quoted_text | Rule::quoted_lone => {
                            value.push_str(quoted_pair.as_str())
                        }
                        Rule::escape => value.push(parse_escape(quoted_pair)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Ok(value)
}

fn parse_escape(pair: Pair<Rule>) -> Result<char> {
    let code = pair
        .into_inner()
        .next()
        .ok_or_else(|| SpawnlineError::ParseError("Empty escape sequence".to_string()))?;

    match code.as_str() {
        "\\" => Ok('\\'),
        "n" => Ok('\n'),
        "t" => Ok('\t'),
        "r" => Ok('\r'),
        "\"" => Ok('"'),
        "'" => Ok('\''),
        other => Err(SpawnlineError::ParseError(format!(
            "Unknown escape sequence: \\{}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spawnline_core::{escape_argument, join_arguments};

    #[test]
    fn test_parse_simple_line() {
        let argv = parse_argument_line("status --short -b").unwrap();
        assert_eq!(argv, vec!["status", "--short", "-b"]);
    }

    #[test]
    fn test_parse_empty_and_blank_lines() {
        assert!(parse_argument_line("").unwrap().is_empty());
        assert!(parse_argument_line("   \t ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_collapses_separator_runs() {
        let argv = parse_argument_line("  a   b\tc  ").unwrap();
        assert_eq!(argv, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_quoted_group_keeps_spaces() {
        let argv = parse_argument_line("-c \"echo hello world\"").unwrap();
        assert_eq!(argv, vec!["-c", "echo hello world"]);
    }

    #[test]
    fn test_parse_adjacent_quoted_and_bare_parts_join() {
        let argv = parse_argument_line("--name=\"a b\"c").unwrap();
        assert_eq!(argv, vec!["--name=a bc"]);
    }

    #[test]
    fn test_parse_escapes_inside_and_outside_quotes() {
        let argv = parse_argument_line("a\\nb \"x \\\"y\\\"\"").unwrap();
        assert_eq!(argv, vec!["a\nb", "x \"y\""]);
    }

    #[test]
    fn test_parse_escaped_tokens_round_trip() {
        let tokens = ["plain", "tab\there", "quote\"d", "it's", "back\\slash", "cr\r\nlf"];
        let line = join_arguments(tokens, true);
        assert_eq!(parse_argument_line(&line).unwrap(), tokens);
    }

    #[test]
    fn test_parse_unterminated_quote_is_literal() {
        let argv = parse_argument_line("\"never closed").unwrap();
        assert_eq!(argv, vec!["\"never", "closed"]);

        let argv = parse_argument_line("5\" 7").unwrap();
        assert_eq!(argv, vec!["5\"", "7"]);
    }

    #[test]
    fn test_parse_trailing_backslash_is_literal() {
        assert_eq!(parse_argument_line("oops\\").unwrap(), vec!["oops\\"]);
    }

    #[test]
    fn test_parse_unescaped_backslashes_survive() {
        let tokens = ["a\\.b", "\\d+", "C:\\Users\\x", "5\""];
        let line = join_arguments(tokens, false);
        assert_eq!(parse_argument_line(&line).unwrap(), tokens);
    }

    #[test]
    fn test_parse_lone_backslash_inside_quotes() {
        let argv = parse_argument_line("\"C:\\Program Files\\app\"").unwrap();
        assert_eq!(argv, vec!["C:\\Program Files\\app"]);
    }

    #[test]
    fn test_unescape_plain_is_identity() {
        assert_eq!(unescape_argument("hello world").unwrap(), "hello world");
    }

    #[test]
    fn test_unescape_inverts_escape_for_special_characters() {
        let specials = ['\\', '\n', '\t', '\r', '"', '\''];
        let mut samples = Vec::new();
        for a in specials {
            samples.push(a.to_string());
            for b in specials {
                samples.push(format!("{}{}", a, b));
            }
        }
        samples.push(specials.iter().collect());

        for sample in samples {
            let escaped = escape_argument(&sample);
            assert_eq!(unescape_argument(&escaped).unwrap(), sample, "escaped: {:?}", escaped);
        }
    }

    #[test]
    fn test_unescape_unknown_escape_fails() {
        assert!(unescape_argument("\\q").is_err());
    }
}
