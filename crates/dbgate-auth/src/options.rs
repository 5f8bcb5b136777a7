//! Authenticator option string splitting.

use crate::error::AuthError;

/// Maximum number of option tokens passed to an authenticator.
pub const MAX_OPTIONS: usize = 256;

/// Split an authenticator option string on unescaped commas.
///
/// A backslash escapes the character that follows it, and a comma inside a
/// single- or double-quoted section is not a separator. Tokens keep their
/// raw text, escapes and quotes included. An empty string yields no tokens.
pub fn split_options(options: &str) -> Result<Vec<String>, AuthError> {
    if options.is_empty() {
        return Ok(Vec::new());
    }

    let mut tokens = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quote: Option<char> = None;

    for (idx, c) in options.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else if c == '\'' || c == '"' {
            quote = Some(c);
        } else if c == ',' {
            tokens.push(options[start..idx].to_string());
            start = idx + 1;
        }
    }
    tokens.push(options[start..].to_string());

    if tokens.len() > MAX_OPTIONS {
        return Err(AuthError::TooManyOptions {
            count: tokens.len(),
            max: MAX_OPTIONS,
        });
    }

    Ok(tokens)
}
