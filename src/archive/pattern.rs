//! Filename patterns for archived files.
//!
//! A pattern is either a regular expression or a printf-style template with a
//! single numeric placeholder (`%d`, `%0Nd` or `%Nd`). Patterns always match
//! the whole filename stem.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ArchiveError;

static PRINTF_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%(0?)(\d*)d").expect("valid printf token regex"));

/// Whether `pattern` contains a printf-style numeric placeholder.
pub fn is_printf_pattern(pattern: &str) -> bool {
    PRINTF_TOKEN.is_match(pattern)
}

/// Convert a printf-style pattern into an anchored regular expression.
///
/// Literal text is escaped; `%0Nd` becomes `\d{N}`, `%Nd` becomes ` *\d+`
/// and `%d` becomes `\d+`.
pub fn printf_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let mut last = 0;
    for caps in PRINTF_TOKEN.captures_iter(pattern) {
        let Some(token) = caps.get(0) else { continue };
        regex.push_str(&regex::escape(&pattern[last..token.start()]));
        let zero_padded = !caps[1].is_empty();
        let width = &caps[2];
        match (zero_padded, width.is_empty()) {
            (true, false) => regex.push_str(&format!(r"\d{{{width}}}")),
            (false, false) => regex.push_str(r" *\d+"),
            _ => regex.push_str(r"\d+"),
        }
        last = token.end();
    }
    regex.push_str(&regex::escape(&pattern[last..]));
    regex.push('$');
    regex
}

/// Substitute `value` into a pattern with exactly one placeholder.
pub fn fill_printf(pattern: &str, value: u32) -> Option<String> {
    let mut tokens = PRINTF_TOKEN.captures_iter(pattern);
    let caps = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    let token = caps.get(0)?;
    let width: usize = if caps[2].is_empty() { 0 } else { caps[2].parse().ok()? };
    let number = if caps[1].is_empty() {
        format!("{value:>width$}")
    } else {
        format!("{value:0width$}")
    };
    Some(format!(
        "{}{}{}",
        &pattern[..token.start()],
        number,
        &pattern[token.end()..]
    ))
}

/// Anchor a pattern so it matches a whole stem.
pub fn anchor(pattern: &str) -> String {
    if is_printf_pattern(pattern) {
        return printf_to_regex(pattern);
    }
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    anchored
}

/// Compile the stem matcher for `pattern`, narrowed to `cycle` when possible.
///
/// A cycle only narrows printf-style patterns. If the cycle cannot be
/// substituted the cycle is ignored and the general pattern is used.
pub fn build_regex(pattern: &str, cycle: Option<u32>) -> Result<Regex, ArchiveError> {
    let source = match cycle {
        Some(cycle) if is_printf_pattern(pattern) => match fill_printf(pattern, cycle) {
            Some(filled) => format!("^{}$", regex::escape(&filled)),
            None => {
                tracing::debug!(pattern = %pattern, cycle, "Pattern cannot be narrowed to a cycle, ignoring cycle");
                anchor(pattern)
            }
        },
        _ => anchor(pattern),
    };
    Regex::new(&source).map_err(|e| ArchiveError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_padded_width_is_exact() {
        let re = Regex::new(&printf_to_regex("md%04d")).unwrap();
        assert!(re.is_match("md0007"));
        assert!(re.is_match("md1234"));
        assert!(!re.is_match("md007"));
        assert!(!re.is_match("mdabcd"));
        assert!(!re.is_match("xmd0007"));
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(printf_to_regex("run+%d.x"), r"^run\+\d+\.x$");
        assert_eq!(printf_to_regex("a%03d_b%d"), r"^a\d{3}_b\d+$");
    }

    #[test]
    fn plain_regex_is_only_anchored() {
        assert!(!is_printf_pattern("md[0-9]+"));
        assert_eq!(anchor("md[0-9]+"), "^md[0-9]+$");
        assert_eq!(anchor("^md.*$"), "^md.*$");
    }

    #[test]
    fn fill_requires_single_token() {
        assert_eq!(fill_printf("md%04d", 7).as_deref(), Some("md0007"));
        assert_eq!(fill_printf("md%d", 12).as_deref(), Some("md12"));
        assert_eq!(fill_printf("md%3d", 5).as_deref(), Some("md  5"));
        assert_eq!(fill_printf("a%d_b%d", 1), None);
        assert_eq!(fill_printf("plain", 1), None);
    }

    #[test]
    fn cycle_narrows_printf_patterns() {
        let re = build_regex("md%04d", Some(3)).unwrap();
        assert!(re.is_match("md0003"));
        assert!(!re.is_match("md0004"));

        let re = build_regex("md%04d", Some(0)).unwrap();
        assert!(re.is_match("md0000"));
    }

    #[test]
    fn unfillable_cycle_is_ignored() {
        let re = build_regex("a%d_b%d", Some(3)).unwrap();
        assert!(re.is_match("a1_b2"));
        let re = build_regex("md[0-9]+", Some(3)).unwrap();
        assert!(re.is_match("md17"));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let err = build_regex("md(", None).unwrap_err();
        assert!(matches!(err, ArchiveError::Pattern { .. }));
    }
}
