//! Translation of a residual policy query into a SQL `WHERE` fragment over
//! the JSONB `payload` column.
//!
//! The compiler is total: every input, well-typed or not, yields a finite,
//! bracket-balanced fragment. Malformed sub-expressions collapse to `FALSE`
//! (or `TRUE` under a `NOT`) at the innermost scope that owns its own
//! parenthesis instead of failing the whole request.

use std::fmt;

use serde_json::{Map, Value};

const SQL_TRUE: &str = "TRUE";
const SQL_FALSE: &str = "FALSE";

const TERM_KIND_VAR: &str = "var";
const TERM_KIND_STRING: &str = "string";
const TERM_KIND_REF: &str = "ref";

const PAYLOAD_COLUMN: &str = "payload";

const INPUT_VARIABLE: &str = "input";
const CLUSTER_VARIABLE: &str = "cluster";

// operator, first operand, second operand
const TERMS_ARRAY_SIZE: usize = 3;
// a reference must name at least `input.cluster`
const MIN_REFERENCE_PATH_SIZE: usize = 2;

/// A compiled authorization filter. `Display` renders the standalone
/// `WHERE <condition>` fragment; [`Filter::condition`] is the bare condition
/// for composing behind an existing `WHERE` of the caller's choosing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    condition: String,
}

impl Filter {
    pub fn deny_all() -> Self {
        Self {
            condition: SQL_FALSE.to_string(),
        }
    }

    pub fn allow_all() -> Self {
        Self {
            condition: SQL_TRUE.to_string(),
        }
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WHERE {}", self.condition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },
    UnexpectedTermKind {
        expected: &'static str,
        actual: String,
    },
    UnexpectedArraySize {
        expected: usize,
        actual: usize,
    },
    UnexpectedTermCount {
        expected: usize,
        actual: usize,
    },
    MissingAttribute(&'static str),
    UnknownOperator(String),
    UnexpectedValue {
        expected: &'static str,
        actual: String,
    },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnexpectedType { expected, actual } => {
                write!(f, "unexpected type: expected {}, received {}", expected, actual)
            }
            CompileError::UnexpectedTermKind { expected, actual } => {
                write!(f, "unexpected term kind: expected {}, received {}", expected, actual)
            }
            CompileError::UnexpectedArraySize { expected, actual } => {
                write!(f, "unexpected array size: expected {}, received {}", expected, actual)
            }
            CompileError::UnexpectedTermCount { expected, actual } => {
                write!(f, "unexpected term count: expected {}, received {}", expected, actual)
            }
            CompileError::MissingAttribute(attribute) => {
                write!(f, "missing attribute: {}", attribute)
            }
            CompileError::UnknownOperator(operator) => {
                write!(f, "unknown operator: {}", operator)
            }
            CompileError::UnexpectedValue { expected, actual } => {
                write!(f, "unexpected value: expected {}, received {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Compiles the residual queries into a filter.
///
/// Missing or empty queries deny everything; a single query with zero
/// expressions allows everything; anything else becomes a disjunction of
/// conjunction groups.
pub fn compile(queries: Option<&[Value]>) -> Filter {
    let Some(queries) = queries else {
        return Filter::deny_all();
    };
    if queries.is_empty() {
        return Filter::deny_all();
    }

    if queries.len() == 1 && queries[0].as_array().is_some_and(|query| query.is_empty()) {
        return Filter::allow_all();
    }

    let mut condition = String::new();

    for raw_query in queries {
        let Some(query) = raw_query.as_array() else {
            tracing::warn!("residual query group is not an array, skipping");
            continue;
        };
        if query.is_empty() {
            continue;
        }

        condition.push('(');
        for expression in query {
            condition.push_str(&expression_sql(expression));
            condition.push_str(" AND ");
        }
        // TRUE absorbs the dangling AND inside the group.
        condition.push_str(SQL_TRUE);
        condition.push_str(") OR ");
    }

    // FALSE absorbs the dangling OR, and stands alone when every group was
    // skipped.
    condition.push_str(SQL_FALSE);

    Filter { condition }
}

fn expression_sql(expression: &Value) -> String {
    let Some(expression) = expression.as_object() else {
        tracing::warn!("residual expression is not an object, collapsing to FALSE");
        return SQL_FALSE.to_string();
    };

    let negated = expression
        .get("negated")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(terms) = expression.get("terms") else {
        tracing::warn!("residual expression has no terms, collapsing to FALSE");
        return SQL_FALSE.to_string();
    };
    let Some(terms) = terms.as_array() else {
        tracing::warn!("residual expression terms are not an array, collapsing to FALSE");
        return SQL_FALSE.to_string();
    };

    terms_sql(terms, negated)
}

fn terms_sql(terms: &[Value], negated: bool) -> String {
    match equality_sql(terms) {
        Ok(sql) if negated => format!("NOT ({sql})"),
        Ok(sql) => sql,
        Err(err) => {
            tracing::warn!(error = %err, "unable to compile residual expression");
            if negated {
                format!("NOT ({SQL_TRUE})")
            } else {
                SQL_FALSE.to_string()
            }
        }
    }
}

fn equality_sql(terms: &[Value]) -> Result<String, CompileError> {
    if terms.len() != TERMS_ARRAY_SIZE {
        return Err(CompileError::UnexpectedTermCount {
            expected: TERMS_ARRAY_SIZE,
            actual: terms.len(),
        });
    }

    let operator = operator_name(&terms[0])?;
    if operator != "eq" {
        return Err(CompileError::UnknownOperator(operator));
    }

    let first = operand_sql(&terms[1])?;
    let second = operand_sql(&terms[2])?;

    Ok(format!("{first} = {second}"))
}

/// The operator is a reference term whose value is a one-element array
/// holding the built-in's variable name.
fn operator_name(term: &Value) -> Result<String, CompileError> {
    let Some(operator) = term.as_object() else {
        return Err(CompileError::UnexpectedType {
            expected: "object",
            actual: json_kind(term),
        });
    };

    let kind = term_kind(operator)?;
    if kind != TERM_KIND_REF {
        return Err(CompileError::UnexpectedTermKind {
            expected: TERM_KIND_REF,
            actual: kind.to_string(),
        });
    }

    let value = term_value(operator)?;
    let Some(parts) = value.as_array() else {
        return Err(CompileError::UnexpectedType {
            expected: "array",
            actual: json_kind(value),
        });
    };
    if parts.len() != 1 {
        return Err(CompileError::UnexpectedArraySize {
            expected: 1,
            actual: parts.len(),
        });
    }

    term_string_value(&parts[0], TERM_KIND_VAR)
}

fn operand_sql(term: &Value) -> Result<String, CompileError> {
    let Some(operand) = term.as_object() else {
        return Err(CompileError::UnexpectedType {
            expected: "object",
            actual: json_kind(term),
        });
    };

    match term_kind(operand)? {
        TERM_KIND_STRING => {
            let value = term_value(operand)?;
            let Some(literal) = value.as_str() else {
                return Err(CompileError::UnexpectedType {
                    expected: "string",
                    actual: json_kind(value),
                });
            };
            Ok(quote_literal(literal))
        }
        TERM_KIND_REF => reference_sql(operand),
        other => Err(CompileError::UnexpectedTermKind {
            expected: "string or ref",
            actual: other.to_string(),
        }),
    }
}

/// A reference operand must address the unknown cluster record: the path
/// starts with the variable `input` followed by the string `cluster`, and
/// the remainder navigates the JSONB payload.
fn reference_sql(operand: &Map<String, Value>) -> Result<String, CompileError> {
    let value = term_value(operand)?;
    let Some(parts) = value.as_array() else {
        return Err(CompileError::UnexpectedType {
            expected: "array",
            actual: json_kind(value),
        });
    };

    if parts.len() < MIN_REFERENCE_PATH_SIZE {
        return Err(CompileError::UnexpectedTermCount {
            expected: MIN_REFERENCE_PATH_SIZE,
            actual: parts.len(),
        });
    }

    let first = term_string_value(&parts[0], TERM_KIND_VAR)?;
    let second = term_string_value(&parts[1], TERM_KIND_STRING)?;

    if first != INPUT_VARIABLE || second != CLUSTER_VARIABLE {
        return Err(CompileError::UnexpectedValue {
            expected: "input.cluster",
            actual: format!("{first}.{second}"),
        });
    }

    jsonb_path(&parts[2..])
}

/// Builds the JSONB navigation for the path parts after `input.cluster`.
/// Interior steps keep the JSON type; the final step extracts text so the
/// result is comparable to a quoted literal. An empty path degenerates to
/// the bare column.
fn jsonb_path(parts: &[Value]) -> Result<String, CompileError> {
    let mut operand = PAYLOAD_COLUMN.to_string();
    let last = parts.len().saturating_sub(1);

    for (index, part) in parts.iter().enumerate() {
        let field = term_string_value(part, TERM_KIND_STRING)?;
        let path_operator = if index == last { "->>" } else { "->" };
        operand.push(' ');
        operand.push_str(path_operator);
        operand.push(' ');
        operand.push_str(&quote_literal(&field));
    }

    Ok(operand)
}

fn term_kind(term: &Map<String, Value>) -> Result<&str, CompileError> {
    let kind = term
        .get("type")
        .ok_or(CompileError::MissingAttribute("type"))?;
    kind.as_str().ok_or(CompileError::UnexpectedType {
        expected: "string",
        actual: json_kind(kind),
    })
}

fn term_value<'a>(term: &'a Map<String, Value>) -> Result<&'a Value, CompileError> {
    term.get("value")
        .ok_or(CompileError::MissingAttribute("value"))
}

fn term_string_value(term: &Value, expected_kind: &'static str) -> Result<String, CompileError> {
    let Some(term) = term.as_object() else {
        return Err(CompileError::UnexpectedType {
            expected: "object",
            actual: json_kind(term),
        });
    };

    let kind = term_kind(term)?;
    if kind != expected_kind {
        return Err(CompileError::UnexpectedTermKind {
            expected: expected_kind,
            actual: kind.to_string(),
        });
    }

    let value = term_value(term)?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or(CompileError::UnexpectedType {
            expected: "string",
            actual: json_kind(value),
        })
}

/// Single-quoted SQL literal with embedded quotes doubled.
fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
