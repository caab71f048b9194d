//! Turning sanitized text into `(command, args)`.

/// Split on whitespace and expand combined short flags.
///
/// Returns `None` for blank input.
pub fn parse_command(input: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = input.split_whitespace();
    let command = tokens.next()?.to_string();
    let args = tokens.flat_map(expand_short_flags).collect();
    Some((command, args))
}

/// `-abc` becomes `-a -b -c`. Anything else (long flags, `-n5`, plain
/// words, a lone `-`) is returned unchanged.
pub fn expand_short_flags(token: &str) -> Vec<String> {
    let Some(flags) = token.strip_prefix('-') else {
        return vec![token.to_string()];
    };
    if flags.len() < 2 || !flags.chars().all(|c| c.is_ascii_alphabetic()) {
        return vec![token.to_string()];
    }
    flags.chars().map(|c| format!("-{c}")).collect()
}
