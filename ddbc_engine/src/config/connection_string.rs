//! `key=value;` connection-string helpers.

const SECRET_KEYS: &[&str] = &["pwd", "password", "accesstoken", "access_token"];
const MASK: &str = "****";

/// Parses the usual spellings of a boolean flag.
pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Splits on `;` outside of `{...}` quoted values.
pub fn split_connection_string_parts(connection_string: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut brace_depth = 0u32;

    for (idx, ch) in connection_string.char_indices() {
        match ch {
            '{' => brace_depth = brace_depth.saturating_add(1),
            '}' => brace_depth = brace_depth.saturating_sub(1),
            ';' if brace_depth == 0 => {
                parts.push(&connection_string[start..idx]);
                start = idx + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&connection_string[start..]);
    parts
}

/// Copy of the connection string that is safe to log: secret values are
/// replaced by `****`, everything else is kept as written.
pub fn sanitize(connection_string: &str) -> String {
    split_connection_string_parts(connection_string)
        .into_iter()
        .map(|part| match part.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_ascii_lowercase().as_str()) => {
                format!("{}={}", key, MASK)
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Value of `key` (case-insensitive), with surrounding braces removed.
pub fn get_value<'a>(connection_string: &'a str, key: &str) -> Option<&'a str> {
    split_connection_string_parts(connection_string)
        .into_iter()
        .filter_map(|part| part.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| {
            let v = v.trim();
            v.strip_prefix('{')
                .and_then(|inner| inner.strip_suffix('}'))
                .unwrap_or(v)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_flag() {
        assert_eq!(parse_bool_flag(" Yes "), Some(true));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }

    #[test]
    fn test_split_respects_braces() {
        let parts = split_connection_string_parts("Driver={ODBC;18};PWD={a;b};Server=x");
        assert_eq!(parts, vec!["Driver={ODBC;18}", "PWD={a;b}", "Server=x"]);
    }

    #[test]
    fn test_sanitize_masks_secrets() {
        let s = sanitize("Server=db;UID=sa;PWD={p;w};Password=x;Database=app;");
        assert_eq!(s, "Server=db;UID=sa;PWD=****;Password=****;Database=app;");
    }

    #[test]
    fn test_sanitize_leaves_plain_strings() {
        assert_eq!(sanitize("DSN=local"), "DSN=local");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_get_value() {
        let cs = "Driver={ODBC Driver 18 for SQL Server};server=db,1433;";
        assert_eq!(get_value(cs, "DRIVER"), Some("ODBC Driver 18 for SQL Server"));
        assert_eq!(get_value(cs, "Server"), Some("db,1433"));
        assert_eq!(get_value(cs, "Database"), None);
    }
}
