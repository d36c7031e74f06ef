//! Static extraction of test records from Python source using tree-sitter.
//!
//! Nothing is imported or executed: functions, classes and markers are read
//! off the syntax tree.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Mutex;

use fastcollect_core::model::NAME_SEPARATOR;
use fastcollect_core::{Config, ItemKind, ParseError, TestRecord};
use tree_sitter::{Node, Parser, Tree};

/// Mutex to serialize tree-sitter parser creation (C runtime is not thread-safe during init).
static PARSER_LOCK: Mutex<()> = Mutex::new(());

const PYTESTMARK: &str = "pytestmark";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

thread_local! {
    static PARSER: RefCell<Option<Parser>> = const { RefCell::new(None) };
}

fn new_parser() -> Option<Parser> {
    let _guard = PARSER_LOCK.lock().ok()?;
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .ok()?;
    Some(parser)
}

/// Parse with this worker thread's parser, creating it on first use.
fn parse_tree(source: &[u8]) -> Option<Tree> {
    PARSER.with_borrow_mut(|slot| {
        if slot.is_none() {
            *slot = Some(new_parser()?);
        }
        slot.as_mut()?.parse(source, None)
    })
}

/// Extract all test records from one file's bytes.
///
/// `file_path` is recorded verbatim on every record.
///
/// # Errors
///
/// Returns `ParseError::Encoding` for non-UTF-8 input and
/// `ParseError::Syntax` (with the first error location) for malformed source.
pub fn extract_source(
    file_path: &str,
    source: &[u8],
    config: &Config,
) -> Result<Vec<TestRecord>, ParseError> {
    let source = source.strip_prefix(UTF8_BOM).unwrap_or(source);
    if std::str::from_utf8(source).is_err() {
        return Err(ParseError::Encoding {
            path: file_path.to_string(),
        });
    }

    let Some(tree) = parse_tree(source) else {
        return Err(ParseError::Read {
            path: file_path.to_string(),
            message: "python parser unavailable".to_string(),
        });
    };
    let root = tree.root_node();
    if root.has_error() {
        let at = first_error(root).unwrap_or(root).start_position();
        return Err(ParseError::Syntax {
            path: file_path.to_string(),
            line: at.row + 1,
            column: at.column + 1,
        });
    }

    let mut visitor = Visitor {
        source,
        file_path,
        config,
        records: Vec::new(),
    };
    let module_marks = pytestmark_in(root, source);
    visitor.visit_block(root, None, &module_marks);
    Ok(visitor.records)
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    node.children(&mut cursor).find_map(first_error)
}

fn node_text<'a>(node: Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

// ─── Tree walk ──────────────────────────────────────────────────────────────

struct Visitor<'a> {
    source: &'a [u8],
    file_path: &'a str,
    config: &'a Config,
    records: Vec<TestRecord>,
}

impl Visitor<'_> {
    /// Visit the statements of a module or class body.
    ///
    /// `class` is the qualified name of the enclosing test class, if any.
    fn visit_block(&mut self, block: Node, class: Option<&str>, inherited: &BTreeSet<String>) {
        let mut cursor = block.walk();
        for stmt in block.named_children(&mut cursor) {
            match stmt.kind() {
                "function_definition" => self.visit_function(stmt, &[], class, inherited),
                "class_definition" => self.visit_class(stmt, &[], class, inherited),
                "decorated_definition" => {
                    let mut inner = stmt.walk();
                    let decorators: Vec<Node> = stmt
                        .named_children(&mut inner)
                        .filter(|n| n.kind() == "decorator")
                        .collect();
                    let Some(definition) = stmt.child_by_field_name("definition") else {
                        continue;
                    };
                    match definition.kind() {
                        "function_definition" => {
                            self.visit_function(definition, &decorators, class, inherited);
                        }
                        "class_definition" => {
                            self.visit_class(definition, &decorators, class, inherited);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    fn visit_function(
        &mut self,
        def: Node,
        decorators: &[Node],
        class: Option<&str>,
        inherited: &BTreeSet<String>,
    ) {
        let Some(name) = def.child_by_field_name("name").map(|n| node_text(n, self.source)) else {
            return;
        };
        if !self.config.is_test_function(name) {
            return;
        }

        let mut markers = inherited.clone();
        markers.extend(decorator_markers(decorators, self.source));

        let (kind, qualified_name) = match class {
            Some(class) => (ItemKind::Method, format!("{class}{NAME_SEPARATOR}{name}")),
            None => (ItemKind::Function, name.to_string()),
        };
        self.records.push(TestRecord {
            file_path: self.file_path.to_string(),
            qualified_name,
            kind,
            line_number: def.start_position().row + 1,
            markers,
            parent_class: class.map(ToString::to_string),
        });
    }

    fn visit_class(
        &mut self,
        def: Node,
        decorators: &[Node],
        class: Option<&str>,
        inherited: &BTreeSet<String>,
    ) {
        let Some(name) = def.child_by_field_name("name").map(|n| node_text(n, self.source)) else {
            return;
        };
        if !self.config.is_test_class(name) {
            return;
        }
        let body = def.child_by_field_name("body");

        let mut markers = inherited.clone();
        markers.extend(decorator_markers(decorators, self.source));
        if let Some(body) = body {
            markers.extend(pytestmark_in(body, self.source));
        }

        let qualified_name = match class {
            Some(outer) => format!("{outer}{NAME_SEPARATOR}{name}"),
            None => name.to_string(),
        };
        self.records.push(TestRecord {
            file_path: self.file_path.to_string(),
            qualified_name: qualified_name.clone(),
            kind: ItemKind::Class,
            line_number: def.start_position().row + 1,
            markers: markers.clone(),
            parent_class: class.map(ToString::to_string),
        });

        if let Some(body) = body {
            self.visit_block(body, Some(qualified_name.as_str()), &markers);
        }
    }
}

// ─── Markers ────────────────────────────────────────────────────────────────

fn decorator_markers<'a>(
    decorators: &'a [Node<'a>],
    source: &'a [u8],
) -> impl Iterator<Item = String> + 'a {
    decorators
        .iter()
        .filter_map(|d| d.named_child(0))
        .filter_map(move |expr| marker_name(expr, source))
}

/// Marker name from `pytest.mark.NAME` or `mark.NAME`, called or not.
fn marker_name(expr: Node, source: &[u8]) -> Option<String> {
    let target = if expr.kind() == "call" {
        expr.child_by_field_name("function")?
    } else {
        expr
    };
    if target.kind() != "attribute" {
        return None;
    }
    let text = node_text(target, source);
    let parts: Vec<&str> = text.split('.').map(str::trim).collect();
    match parts.as_slice() {
        ["pytest", "mark", name] | ["mark", name] if !name.is_empty() => Some((*name).to_string()),
        _ => None,
    }
}

/// Markers assigned to `pytestmark` directly in `block`.
fn pytestmark_in(block: Node, source: &[u8]) -> BTreeSet<String> {
    let mut markers = BTreeSet::new();
    let mut cursor = block.walk();
    for stmt in block.named_children(&mut cursor) {
        if stmt.kind() != "expression_statement" {
            continue;
        }
        let Some(assignment) = stmt.named_child(0).filter(|n| n.kind() == "assignment") else {
            continue;
        };
        let is_pytestmark = assignment
            .child_by_field_name("left")
            .is_some_and(|l| l.kind() == "identifier" && node_text(l, source) == PYTESTMARK);
        let Some(value) = assignment.child_by_field_name("right") else {
            continue;
        };
        if !is_pytestmark {
            continue;
        }
        match value.kind() {
            "list" | "tuple" => {
                let mut inner = value.walk();
                markers.extend(
                    value
                        .named_children(&mut inner)
                        .filter_map(|e| marker_name(e, source)),
                );
            }
            _ => markers.extend(marker_name(value, source)),
        }
    }
    markers
}
