// ---------------------------------------------------------------------------
// Shell quoting for commands executed inside the sandbox
// ---------------------------------------------------------------------------

/// Single-quote `value` for a POSIX shell command line.
///
/// Everything the sandbox runs goes through `sh -c`, so any user-supplied
/// path or message must pass through here first.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':'))
    {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Quote and join a list of paths for one command line.
pub fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|v| quote(v))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tokens_pass_unquoted() {
        assert_eq!(quote("src/main.rs"), "src/main.rs");
        assert_eq!(quote("feature-1_2.txt"), "feature-1_2.txt");
    }

    #[test]
    fn spaces_and_specials_are_quoted() {
        assert_eq!(quote("my file.txt"), "'my file.txt'");
        assert_eq!(quote("a;rm -rf /"), "'a;rm -rf /'");
        assert_eq!(quote("$(whoami)"), "'$(whoami)'");
    }

    #[test]
    fn embedded_single_quotes_survive() {
        assert_eq!(quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn empty_string_is_quoted() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn quote_all_joins_with_spaces() {
        let paths = vec!["a.txt".to_string(), "b c.txt".to_string()];
        assert_eq!(quote_all(&paths), "a.txt 'b c.txt'");
    }
}
