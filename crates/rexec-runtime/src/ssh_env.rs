use std::collections::BTreeMap;

/// Quote a value for safe inclusion in a POSIX shell command line.
///
/// Replaces each `'` with `'\''` (end quote, escaped literal quote, start new quote)
/// and wraps the result in single quotes, so `$`, backticks and newlines stay literal.
pub fn shell_quote(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Whether `name` can be used as a shell variable name.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Build `export K='V'\n` lines for all env vars, in key order.
///
/// Returns an empty string if the map is empty.
pub fn build_env_exports(env_vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env_vars {
        out.push_str("export ");
        out.push_str(key);
        out.push('=');
        out.push_str(&shell_quote(value));
        out.push('\n');
    }
    out
}

/// The command line actually sent to the remote shell.
pub fn command_line(command: &str, env_vars: &BTreeMap<String, String>) -> String {
    if env_vars.is_empty() {
        return command.to_string();
    }
    format!("{}{}", build_env_exports(env_vars), command)
}
