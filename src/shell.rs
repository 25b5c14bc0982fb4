// src/shell.rs

//! Shell quoting helpers for handler and probe command lines.

use std::borrow::Cow;

use shell_escape::escape;

/// Quote a single word for safe interpolation into a `sh -c` string.
pub fn quote(s: &str) -> String {
    escape(Cow::Borrowed(s)).into_owned()
}

/// Split a configured command string (e.g. `ssh -oBatchMode=yes`) into words.
///
/// Only whitespace separation and single/double quotes are understood;
/// configured tool commands never need more.
pub fn split(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote_char: Option<char> = None;

    for c in s.chars() {
        match quote_char {
            Some(q) if c == q => quote_char = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote_char = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
