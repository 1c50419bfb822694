//! Deterministic repair chain for malformed generated code.
//!
//! A fixed, ordered table of pure text fixers, each fixing one narrow class
//! of model-output damage. Order matters: body completion runs before quote
//! balancing because an inserted placeholder body can introduce the closing
//! token a later fixer looks for, and docstring-delimiter closing runs
//! before generic string closing so a truncated docstring is not mistaken
//! for a mismatched single-line literal.

use crate::syntax::{self, SyntaxCheck};
use regex::Regex;
use std::sync::OnceLock;

const MAX_REPAIR_ITERATIONS: usize = 3;

type FixFn = fn(&str) -> (String, bool);

const FIXERS: &[(&str, FixFn)] = &[
    ("normalize_quotes", normalize_quotes),
    ("complete_empty_bodies", complete_empty_bodies),
    ("close_docstring_delimiters", close_docstring_delimiters),
    ("close_string_literals", close_string_literals),
    ("strip_trailing_whitespace", strip_trailing_whitespace),
];

/// Run the full chain for up to three iterations, accumulating the names of
/// fixers that fired. Exits early once the candidate parses, or when an
/// iteration changes nothing. Unfixable code comes back best-effort; the
/// caller escalates to validation/correction.
pub fn apply_all_repairs(code: &str) -> (String, Vec<String>) {
    let mut current = code.to_string();
    let mut applied: Vec<String> = Vec::new();

    for _ in 0..MAX_REPAIR_ITERATIONS {
        if matches!(syntax::check(&current), SyntaxCheck::Valid) {
            break;
        }

        let mut changed_this_round = false;
        for (name, fix) in FIXERS {
            let (next, changed) = fix(&current);
            if changed {
                current = next;
                changed_this_round = true;
                if !applied.iter().any(|n| n == name) {
                    applied.push((*name).to_string());
                }
            }
        }

        if !changed_this_round {
            break;
        }
    }

    (current, applied)
}

/// Rewrite smart quotes to ASCII and drop stray control characters.
/// Models pick these up from prose in their training data.
fn normalize_quotes(code: &str) -> (String, bool) {
    let fixed: String = code
        .replace('\u{201C}', "\"") // Left double quote
        .replace('\u{201D}', "\"") // Right double quote
        .replace('\u{2018}', "'") // Left single quote
        .replace('\u{2019}', "'") // Right single quote
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect();
    let changed = fixed != code;
    (fixed, changed)
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:async\s+def|def|class)\b.*:\s*(?:#.*)?$").unwrap())
}

/// Give `def`/`class` headers with no body an indented `pass`.
fn complete_empty_bodies(code: &str) -> (String, bool) {
    let lines: Vec<&str> = code.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut changed = false;
    let mut triple: Option<&'static str> = None;

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());

        let started_inside_string = triple.is_some();
        triple = advance_triple_state(line, triple);
        if started_inside_string {
            continue;
        }
        if !header_regex().is_match(line.trim_start()) {
            continue;
        }

        let indent = indent_width(line);
        let next = lines[i + 1..].iter().find(|l| !l.trim().is_empty());
        let needs_body = match next {
            None => true,
            Some(l) => indent_width(l) <= indent,
        };
        if needs_body {
            out.push(format!("{}pass", " ".repeat(indent + 4)));
            changed = true;
        }
    }

    (rejoin(out, code), changed)
}

/// Close a triple-quoted string left open at end of input.
fn close_docstring_delimiters(code: &str) -> (String, bool) {
    let mut triple: Option<&'static str> = None;
    for line in code.lines() {
        triple = advance_triple_state(line, triple);
    }
    match triple {
        Some(delim) => {
            let mut fixed = code.to_string();
            if !fixed.ends_with('\n') {
                fixed.push('\n');
            }
            fixed.push_str(delim);
            fixed.push('\n');
            (fixed, true)
        }
        None => (code.to_string(), false),
    }
}

/// Close single-line string literals left open at end of line. Skips lines
/// inside or containing triple-quoted strings; those belong to the
/// docstring fixer.
fn close_string_literals(code: &str) -> (String, bool) {
    let mut out: Vec<String> = Vec::new();
    let mut changed = false;
    let mut triple: Option<&'static str> = None;

    for line in code.lines() {
        let started_inside_string = triple.is_some();
        let has_triple = line.contains("\"\"\"") || line.contains("'''");
        triple = advance_triple_state(line, triple);

        if started_inside_string || has_triple {
            out.push(line.to_string());
            continue;
        }

        match open_quote_at_line_end(line) {
            Some(q) => {
                out.push(format!("{}{}", line, q));
                changed = true;
            }
            None => out.push(line.to_string()),
        }
    }

    (rejoin(out, code), changed)
}

fn strip_trailing_whitespace(code: &str) -> (String, bool) {
    let mut changed = false;
    let out: Vec<String> = code
        .lines()
        .map(|line| {
            let stripped = line.trim_end();
            if stripped.len() != line.len() {
                changed = true;
            }
            stripped.to_string()
        })
        .collect();
    (rejoin(out, code), changed)
}

/// Track whether a triple-quoted string is open after scanning `line`,
/// given the state it started in.
fn advance_triple_state(line: &str, state: Option<&'static str>) -> Option<&'static str> {
    let mut state = state;
    let mut iter = line.char_indices();
    while let Some((i, _)) = iter.next() {
        let rest = &line[i..];
        let matched = match state {
            None => {
                if rest.starts_with("\"\"\"") {
                    state = Some("\"\"\"");
                    true
                } else if rest.starts_with("'''") {
                    state = Some("'''");
                    true
                } else {
                    false
                }
            }
            Some(delim) => {
                if rest.starts_with(delim) {
                    state = None;
                    true
                } else {
                    false
                }
            }
        };
        if matched {
            // Consume the remaining two quote characters of the delimiter.
            iter.next();
            iter.next();
        }
    }
    state
}

/// Scan one line outside any triple-quoted block; return the quote character
/// of a string literal still open when the line ends. Comments end the scan,
/// escapes are honored, so an apostrophe inside a double-quoted literal does
/// not count.
fn open_quote_at_line_end(line: &str) -> Option<char> {
    let mut open: Option<char> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match open {
            None => match c {
                '#' => break,
                '"' | '\'' => open = Some(c),
                _ => {}
            },
            Some(q) => match c {
                '\\' => {
                    let _ = chars.next();
                }
                c if c == q => open = None,
                _ => {}
            },
        }
    }
    open
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

/// Join repaired lines, matching the original's trailing newline.
fn rejoin(lines: Vec<String>, original: &str) -> String {
    let mut joined = lines.join("\n");
    if original.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::SyntaxCheck;

    #[test]
    fn test_valid_code_is_untouched() {
        let code = "def test_ok():\n    assert 1 + 1 == 2\n";
        let (repaired, applied) = apply_all_repairs(code);
        assert_eq!(repaired, code);
        assert!(applied.is_empty());
    }

    #[test]
    fn test_smart_quotes_are_normalized() {
        let code = "def test_msg():\n    assert f(\u{201C}hello\u{201D}) == \u{2018}ok\u{2019}\n";
        let (repaired, applied) = apply_all_repairs(code);
        assert!(repaired.contains("\"hello\""));
        assert!(repaired.contains("'ok'"));
        assert!(applied.contains(&"normalize_quotes".to_string()));
    }

    #[test]
    fn test_empty_body_gets_pass() {
        let code = "def helper():\n\ndef test_helper():\n    assert helper() is None\n";
        let (repaired, applied) = apply_all_repairs(code);
        assert_eq!(syntax::check(&repaired), SyntaxCheck::Valid);
        assert!(repaired.contains("    pass"));
        assert!(applied.contains(&"complete_empty_bodies".to_string()));
    }

    #[test]
    fn test_truncated_docstring_is_closed() {
        let code = "def test_doc():\n    \"\"\"Model stopped mid-docstring\n    assert True\n";
        let (repaired, applied) = apply_all_repairs(code);
        assert!(applied.contains(&"close_docstring_delimiters".to_string()));
        let opens = repaired.matches("\"\"\"").count();
        assert_eq!(opens % 2, 0);
    }

    #[test]
    fn test_open_single_line_string_is_closed() {
        let code = "def test_name():\n    value = \"unterminated\n    assert value\n";
        let (repaired, applied) = apply_all_repairs(code);
        assert!(applied.contains(&"close_string_literals".to_string()));
        assert!(repaired.contains("\"unterminated\""));
    }

    #[test]
    fn test_apostrophe_inside_double_quotes_is_not_closed() {
        assert_eq!(open_quote_at_line_end("    x = \"it's fine\""), None);
        assert_eq!(open_quote_at_line_end("    # don't"), None);
        assert_eq!(open_quote_at_line_end("    x = 'open"), Some('\''));
    }

    #[test]
    fn test_converges_within_three_iterations() {
        // One unbalanced triple delimiter plus one empty body: the chain's
        // fixed-point guarantee.
        let code = "def helper():\n\ndef test_helper():\n    \"\"\"doc\n";
        let (repaired, _) = apply_all_repairs(code);
        assert_eq!(syntax::check(&repaired), SyntaxCheck::Valid);
    }

    #[test]
    fn test_unfixable_code_returned_unchanged() {
        let code = "def test_broken(:\n    assert True\n";
        let (repaired, applied) = apply_all_repairs(code);
        // No fixer claims this defect; best-effort means hand it back as-is.
        assert_eq!(repaired, code);
        assert!(applied.is_empty());
    }

    #[test]
    fn test_trailing_whitespace_stripped_while_repairing() {
        let code = "def test_pad():   \n    \"\"\"doc\n";
        let (repaired, applied) = apply_all_repairs(code);
        assert!(applied.contains(&"strip_trailing_whitespace".to_string()));
        assert!(!repaired.lines().any(|l| l.ends_with(' ')));
    }

    #[test]
    fn test_docstring_fixer_ignores_balanced_strings() {
        let code = "def test_doc():\n    \"\"\"fine\"\"\"\n    assert True\n";
        let (fixed, changed) = close_docstring_delimiters(code);
        assert!(!changed);
        assert_eq!(fixed, code);
    }

    #[test]
    fn test_class_header_body_completion() {
        let code = "class TestThing:\n";
        let (fixed, changed) = complete_empty_bodies(code);
        assert!(changed);
        assert!(fixed.contains("    pass"));
    }
}
