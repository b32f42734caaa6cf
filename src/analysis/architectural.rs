//! Architectural coherence analysis.
//!
//! Parses the submitted source with tree-sitter's TypeScript grammar (a
//! superset of the JavaScript agents submit) and derives:
//!
//! - cyclomatic complexity: `1 + decision points`
//! - Halstead volume over leaf tokens, delimiters excluded
//! - physical SLOC: lines holding at least one token
//! - maintainability index: `171 - 5.2 ln V - 0.23 CC - 16.2 ln SLOC`
//!
//! The score is the maintainability index over a configurable ceiling,
//! clamped to `[0, 1]`. Source that does not parse scores 0.0 and carries
//! no metrics.

use std::collections::{BTreeSet, HashMap};

use tree_sitter::{Node, Parser};

use crate::evaluation::{round_score, ArchitecturalAnalysis, ComplexityMetrics};

/// Reference maintainability index ceiling.
pub const DEFAULT_MAINTAINABILITY_CEILING: f64 = 171.0;

/// Cyclomatic complexity above which a note is added to the details.
pub const DEFAULT_COMPLEXITY_THRESHOLD: u32 = 10;

const DECISION_KINDS: &[&str] = &[
    "if_statement",
    "for_statement",
    "for_in_statement",
    "while_statement",
    "do_statement",
    "switch_case",
    "catch_clause",
    "ternary_expression",
];

const SHORT_CIRCUIT_OPERATORS: &[&str] = &["&&", "||", "??"];

const FUNCTION_KINDS: &[&str] = &[
    "function_declaration",
    "function_expression",
    "function",
    "generator_function_declaration",
    "generator_function",
    "arrow_function",
    "method_definition",
];

const OPERAND_KINDS: &[&str] = &[
    "identifier",
    "property_identifier",
    "shorthand_property_identifier",
    "shorthand_property_identifier_pattern",
    "private_property_identifier",
    "type_identifier",
    "statement_identifier",
    "number",
    "string",
    "template_string",
    "regex",
    "true",
    "false",
    "null",
    "undefined",
    "this",
];

/// Nodes counted as one token even though the grammar gives them children.
const ATOMIC_KINDS: &[&str] = &["string", "template_string", "regex"];

const DELIMITERS: &[&str] = &["(", ")", "{", "}", "[", "]", ",", ";"];

/// Where and why parsing failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    pub line: Option<usize>,
    pub message: String,
}

impl ParseFailure {
    fn details(&self) -> String {
        let line = self
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        format!(
            "Architectural analysis failed: syntax error at line {}. {}",
            line, self.message
        )
    }
}

/// Computes complexity metrics and the architectural score.
#[derive(Debug, Clone)]
pub struct ArchitecturalAnalyzer {
    ceiling: f64,
    complexity_threshold: u32,
}

impl Default for ArchitecturalAnalyzer {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_MAINTAINABILITY_CEILING,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
        }
    }
}

impl ArchitecturalAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maintainability ceiling. Non-positive values keep the default.
    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        if ceiling.is_finite() && ceiling > 0.0 {
            self.ceiling = ceiling;
        }
        self
    }

    pub fn with_complexity_threshold(mut self, threshold: u32) -> Self {
        self.complexity_threshold = threshold;
        self
    }

    /// Scores `source_code`. Never fails: parse errors become a 0.0 result.
    pub fn analyze(&self, source_code: &str) -> ArchitecturalAnalysis {
        match compute_metrics(source_code) {
            Ok(metrics) => {
                let score = (metrics.maintainability_index / self.ceiling).clamp(0.0, 1.0);
                let mut details = format!(
                    "Maintainability index {:.2} (cyclomatic complexity {}, {} function(s), {} SLOC).",
                    metrics.maintainability_index, metrics.cyclomatic, metrics.functions, metrics.sloc
                );
                if metrics.cyclomatic > self.complexity_threshold {
                    details.push_str(&format!(
                        " High cyclomatic complexity ({} > {}): consider splitting the logic into smaller units.",
                        metrics.cyclomatic, self.complexity_threshold
                    ));
                }

                ArchitecturalAnalysis {
                    score,
                    details,
                    metrics: Some(metrics),
                }
            }
            Err(failure) => ArchitecturalAnalysis {
                score: 0.0,
                details: failure.details(),
                metrics: None,
            },
        }
    }
}

/// Parses `source_code` and computes its complexity metrics.
pub fn compute_metrics(source_code: &str) -> Result<ComplexityMetrics, ParseFailure> {
    let mut parser = Parser::new();
    let language: tree_sitter::Language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into();
    parser.set_language(&language).map_err(|e| ParseFailure {
        line: None,
        message: format!("grammar unavailable: {}", e),
    })?;

    let tree = parser.parse(source_code, None).ok_or_else(|| ParseFailure {
        line: None,
        message: "parser produced no tree".to_string(),
    })?;
    let root = tree.root_node();

    if root.has_error() {
        return Err(first_error(root, source_code));
    }

    let mut counter = TokenCounter::new(source_code.as_bytes());
    counter.visit(root);
    Ok(counter.finish())
}

fn first_error(root: Node<'_>, source: &str) -> ParseFailure {
    let mut earliest: Option<Node<'_>> = None;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            match earliest {
                Some(e) if e.start_byte() <= node.start_byte() => {}
                _ => earliest = Some(node),
            }
            continue;
        }
        if node.has_error() {
            let mut cursor = node.walk();
            stack.extend(node.children(&mut cursor));
        }
    }

    match earliest {
        Some(node) if node.is_missing() => ParseFailure {
            line: Some(node.start_position().row + 1),
            message: format!("Missing `{}`.", node.kind()),
        },
        Some(node) => {
            let snippet: String = node
                .utf8_text(source.as_bytes())
                .unwrap_or_default()
                .chars()
                .take(40)
                .collect();
            ParseFailure {
                line: Some(node.start_position().row + 1),
                message: format!("Unexpected `{}`.", snippet.trim()),
            }
        }
        None => ParseFailure {
            line: None,
            message: "Source could not be parsed.".to_string(),
        },
    }
}

struct TokenCounter<'a> {
    source: &'a [u8],
    decisions: u32,
    functions: u32,
    operators: HashMap<String, u32>,
    operands: HashMap<String, u32>,
    rows: BTreeSet<usize>,
}

impl<'a> TokenCounter<'a> {
    fn new(source: &'a [u8]) -> Self {
        Self {
            source,
            decisions: 0,
            functions: 0,
            operators: HashMap::new(),
            operands: HashMap::new(),
            rows: BTreeSet::new(),
        }
    }

    fn visit(&mut self, root: Node<'_>) {
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            let kind = node.kind();
            if kind == "comment" {
                continue;
            }

            if node.is_named() {
                if DECISION_KINDS.contains(&kind) {
                    self.decisions += 1;
                } else if kind == "binary_expression" && self.is_short_circuit(node) {
                    self.decisions += 1;
                }
                if FUNCTION_KINDS.contains(&kind) {
                    self.functions += 1;
                }
            }

            let atomic = node.is_named() && ATOMIC_KINDS.contains(&kind);
            if atomic || node.child_count() == 0 {
                if node.end_byte() > node.start_byte() {
                    self.record_token(node);
                }
                continue;
            }

            let mut cursor = node.walk();
            stack.extend(node.children(&mut cursor));
        }
    }

    fn is_short_circuit(&self, node: Node<'_>) -> bool {
        node.child_by_field_name("operator")
            .map(|op| SHORT_CIRCUIT_OPERATORS.contains(&op.kind()))
            .unwrap_or(false)
    }

    fn record_token(&mut self, node: Node<'_>) {
        let kind = node.kind();
        if DELIMITERS.contains(&kind) {
            return;
        }
        for row in node.start_position().row..=node.end_position().row {
            self.rows.insert(row);
        }

        if node.is_named() && OPERAND_KINDS.contains(&kind) {
            let text = node.utf8_text(self.source).unwrap_or(kind).to_string();
            *self.operands.entry(text).or_insert(0) += 1;
        } else {
            *self.operators.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    fn finish(self) -> ComplexityMetrics {
        let distinct = (self.operators.len() + self.operands.len()) as f64;
        let total = (self.operators.values().sum::<u32>() + self.operands.values().sum::<u32>()) as f64;
        let volume = if distinct > 0.0 {
            total * distinct.log2()
        } else {
            0.0
        };

        let cyclomatic = 1 + self.decisions;
        let sloc = self.rows.len() as u32;
        let maintainability_index = maintainability_index(volume, cyclomatic, sloc);

        ComplexityMetrics {
            cyclomatic,
            maintainability_index: round_score(maintainability_index),
            halstead_volume: round_score(volume),
            sloc,
            functions: self.functions,
        }
    }
}

/// Classic maintainability index. Degenerate inputs score the maximum.
pub fn maintainability_index(volume: f64, cyclomatic: u32, sloc: u32) -> f64 {
    if volume <= 0.0 || sloc == 0 {
        return DEFAULT_MAINTAINABILITY_CEILING;
    }
    DEFAULT_MAINTAINABILITY_CEILING
        - 5.2 * volume.ln()
        - 0.23 * f64::from(cyclomatic)
        - 16.2 * f64::from(sloc).ln()
}
