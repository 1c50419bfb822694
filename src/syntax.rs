//! Syntax plausibility check for candidate Python code.
//!
//! Parse failure is data, not an error: callers branch on the tagged result
//! to decide whether another repair pass or an escalation is warranted.

use std::cell::RefCell;
use tree_sitter::{Node, Parser};

// Tree-sitter parsers are expensive to create but reusable across candidates,
// so each thread keeps one pre-configured Python parser.
thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A grammar that fails to load just surfaces as parse failures later.
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// Outcome of parsing a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    Valid,
    Invalid(String),
}

impl SyntaxCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SyntaxCheck::Valid)
    }
}

/// Parse `code` as Python and report the first syntax defect, if any.
pub fn check(code: &str) -> SyntaxCheck {
    let tree = PYTHON_PARSER.with(|p| p.borrow_mut().parse(code, None));
    let Some(tree) = tree else {
        return SyntaxCheck::Invalid("parser produced no tree".to_string());
    };

    let root = tree.root_node();
    if !root.has_error() {
        return SyntaxCheck::Valid;
    }

    match find_first_defect(root) {
        Some(node) => {
            let line = node.start_position().row + 1;
            if node.is_missing() {
                SyntaxCheck::Invalid(format!("missing {} near line {}", node.kind(), line))
            } else {
                SyntaxCheck::Invalid(format!("syntax error near line {}", line))
            }
        }
        None => SyntaxCheck::Invalid("syntax error".to_string()),
    }
}

/// Depth-first search for the first ERROR or missing node, descending only
/// into subtrees that contain one.
fn find_first_defect(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.is_error() || child.is_missing() {
            return Some(child);
        }
        if child.has_error() {
            if let Some(found) = find_first_defect(child) {
                return Some(found);
            }
        }
    }
    None
}
