use std::borrow::Cow;

const SPECIAL: [char; 6] = ['\\', '\n', '\t', '\r', '"', '\''];

/// Escape one argument token so it survives being joined into an argument line.
///
/// Only backslash, the two quote characters and the whitespace control
/// characters are rewritten; plain spaces are left alone.
pub fn escape_argument(token: &str) -> Cow<'_, str> {
    if !token.contains(SPECIAL) {
        return Cow::Borrowed(token);
    }

    let mut escaped = String::with_capacity(token.len() + 8);
    for c in token.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            '"' => escaped.push_str("\\\""),
            '\'' => escaped.push_str("\\'"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// Join tokens with single spaces, escaping each one first when asked.
pub fn join_arguments<I, S>(tokens: I, escape: bool) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|token| {
            if escape {
                escape_argument(token.as_ref()).into_owned()
            } else {
                token.as_ref().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
