//! Display quoting for command arguments.
//!
//! Quoting here is naive on purpose: an argument that is empty, blank or
//! contains a space is wrapped in double quotes, and embedded quotes are left
//! as they are. The result is meant for log lines, not for a shell. Processes
//! are always launched with discrete argument tokens.

/// Quote a single argument when needed.
pub fn quote_one(arg: &str) -> String {
    if arg.trim().is_empty() || arg.contains(' ') {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

/// Quote each argument and join them with a single space.
pub fn quote_all<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote_one(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_one_plain() {
        assert_eq!(quote_one("plain"), "plain");
    }

    #[test]
    fn test_quote_one_empty_and_blank() {
        assert_eq!(quote_one(""), "\"\"");
        assert_eq!(quote_one("\t"), "\"\t\"");
    }

    #[test]
    fn test_quote_one_with_space() {
        assert_eq!(quote_one("has space"), "\"has space\"");
    }

    #[test]
    fn test_quote_one_does_not_escape_quotes() {
        assert_eq!(quote_one("say \"hi\""), "\"say \"hi\"\"");
        assert_eq!(quote_one("a\"b"), "a\"b");
    }

    #[test]
    fn test_quote_all() {
        assert_eq!(quote_all(["a", "b c"]), "a \"b c\"");
        assert_eq!(quote_all(Vec::<String>::new()), "");
    }
}
