//! RFC 6570 URI Template engine
//!
//! `parse` builds a reusable AST once; `resolve` expands it any number of
//! times against a variable map. Undefined (absent) variables are skipped;
//! `null` is "present but valueless" only under the `;` operator; an empty
//! string is a real zero-length value.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use thiserror::Error;

/// Everything except unreserved characters is percent-encoded.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// For `+` and `#`, reserved characters (and existing pct-triplets) pass
/// through unencoded.
const ALLOW_RESERVED: &AsciiSet = &UNRESERVED
    .remove(b':')
    .remove(b'/')
    .remove(b'?')
    .remove(b'#')
    .remove(b'[')
    .remove(b']')
    .remove(b'@')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=')
    .remove(b'%');

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("unterminated expression at offset {0}")]
    Unterminated(usize),
    #[error("empty expression at offset {0}")]
    EmptyExpression(usize),
    #[error("nested '{{' at offset {0}")]
    NestedExpression(usize),
    #[error("invalid variable name '{0}'")]
    InvalidVariableName(String),
    #[error("invalid prefix length in '{0}'")]
    InvalidPrefixLength(String),
    #[error("prefix length and explode cannot be combined in '{0}'")]
    ConflictingModifiers(String),
}

/// Expression operator. Controls the join prefix, separator, whether
/// values are name-prefixed, and the encoding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `{var}`
    Simple,
    /// `{+var}`
    Reserved,
    /// `{#var}`
    Fragment,
    /// `{.var}`
    Label,
    /// `{/var}`
    Path,
    /// `{;var}`
    PathParam,
    /// `{?var}`
    Query,
    /// `{&var}`
    QueryContinuation,
}

impl Operator {
    fn from_lead(c: char) -> Option<Operator> {
        match c {
            '+' => Some(Operator::Reserved),
            '#' => Some(Operator::Fragment),
            '.' => Some(Operator::Label),
            '/' => Some(Operator::Path),
            ';' => Some(Operator::PathParam),
            '?' => Some(Operator::Query),
            '&' => Some(Operator::QueryContinuation),
            _ => None,
        }
    }

    fn first(&self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved => "",
            Operator::Fragment => "#",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query => "?",
            Operator::QueryContinuation => "&",
        }
    }

    fn separator(&self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved | Operator::Fragment => ",",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query | Operator::QueryContinuation => "&",
        }
    }

    fn named(&self) -> bool {
        matches!(
            self,
            Operator::PathParam | Operator::Query | Operator::QueryContinuation
        )
    }

    /// What follows the name when the value is empty: `;name` stays bare,
    /// `?name=` / `&name=` keep the equals sign.
    fn empty_suffix(&self) -> &'static str {
        match self {
            Operator::PathParam => "",
            _ => "=",
        }
    }

    fn encode_set(&self) -> &'static AsciiSet {
        match self {
            Operator::Reserved | Operator::Fragment => ALLOW_RESERVED,
            _ => UNRESERVED,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarSpec {
    pub name: String,
    /// `*`: arrays become one pair per element, objects one per property.
    pub explode: bool,
    /// `:N`: truncate the value to N characters before encoding.
    pub prefix: Option<usize>,
    /// Trailing `?`: marks the variable optional for callers that
    /// distinguish null from absent when binding.
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expression { operator: Operator, variables: Vec<VarSpec> },
}

/// A parsed, reusable URI Template.
#[derive(Debug, Clone, PartialEq)]
pub struct UriTemplate {
    parts: Vec<Part>,
}

impl UriTemplate {
    pub fn parse(template: &str) -> Result<UriTemplate, TemplateError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            let mut body = String::new();
            let mut terminated = false;
            for (inner_offset, inner) in chars.by_ref() {
                match inner {
                    '}' => {
                        terminated = true;
                        break;
                    }
                    '{' => return Err(TemplateError::NestedExpression(inner_offset)),
                    other => body.push(other),
                }
            }
            if !terminated {
                return Err(TemplateError::Unterminated(offset));
            }
            parts.push(parse_expression(&body, offset)?);
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(UriTemplate { parts })
    }

    /// Expand against a variable map. Pure and stateless; the output is a
    /// fully resolved string, never re-parsed.
    pub fn resolve(&self, vars: &Map<String, Value>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expression { operator, variables } => {
                    expand_expression(*operator, variables, vars, &mut out);
                }
            }
        }
        out
    }

    /// Variable names referenced by the template, in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for part in &self.parts {
            if let Part::Expression { variables, .. } = part {
                for spec in variables {
                    if !names.contains(&spec.name.as_str()) {
                        names.push(spec.name.as_str());
                    }
                }
            }
        }
        names
    }
}

fn parse_expression(body: &str, offset: usize) -> Result<Part, TemplateError> {
    if body.is_empty() {
        return Err(TemplateError::EmptyExpression(offset));
    }
    let (operator, rest) = match body.chars().next().and_then(Operator::from_lead) {
        Some(op) => (op, &body[1..]),
        None => (Operator::Simple, body),
    };
    if rest.is_empty() {
        return Err(TemplateError::EmptyExpression(offset));
    }
    let variables = rest
        .split(',')
        .map(parse_varspec)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Part::Expression { operator, variables })
}

fn parse_varspec(spec: &str) -> Result<VarSpec, TemplateError> {
    let original = spec;
    let (spec, optional) = match spec.strip_suffix('?') {
        Some(stripped) => (stripped, true),
        None => (spec, false),
    };
    let (spec, explode) = match spec.strip_suffix('*') {
        Some(stripped) => (stripped, true),
        None => (spec, false),
    };
    let (name, prefix) = match spec.split_once(':') {
        Some((name, len)) => {
            let len: usize = len
                .parse()
                .map_err(|_| TemplateError::InvalidPrefixLength(original.to_string()))?;
            (name, Some(len))
        }
        None => (spec, None),
    };
    if explode && prefix.is_some() {
        return Err(TemplateError::ConflictingModifiers(original.to_string()));
    }
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '%'))
    {
        return Err(TemplateError::InvalidVariableName(original.to_string()));
    }
    Ok(VarSpec {
        name: name.to_string(),
        explode,
        prefix,
        optional,
    })
}

fn expand_expression(
    operator: Operator,
    variables: &[VarSpec],
    vars: &Map<String, Value>,
    out: &mut String,
) {
    let mut parts: Vec<String> = Vec::new();
    for spec in variables {
        let value = match vars.get(&spec.name) {
            // Undefined always means skip.
            None => continue,
            Some(Value::Null) => {
                // Present but valueless, only meaningful under `;`.
                if operator == Operator::PathParam {
                    parts.push(encode(&spec.name, operator.encode_set()));
                }
                continue;
            }
            Some(value) => value,
        };
        expand_value(operator, spec, value, &mut parts);
    }
    if parts.is_empty() {
        return;
    }
    out.push_str(operator.first());
    out.push_str(&parts.join(operator.separator()));
}

fn expand_value(operator: Operator, spec: &VarSpec, value: &Value, parts: &mut Vec<String>) {
    let set = operator.encode_set();
    match value {
        Value::Array(items) if spec.explode => {
            for item in items {
                let text = encode(&scalar_text(item, None), set);
                if operator.named() {
                    parts.push(named_pair(&spec.name, &text, operator, set));
                } else {
                    parts.push(text);
                }
            }
        }
        Value::Object(map) if spec.explode => {
            for (key, item) in map {
                let key = encode(key, set);
                let text = encode(&scalar_text(item, None), set);
                parts.push(format!("{key}={text}"));
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                return;
            }
            let joined = items
                .iter()
                .map(|item| encode(&scalar_text(item, None), set))
                .collect::<Vec<_>>()
                .join(",");
            if operator.named() {
                parts.push(named_pair(&spec.name, &joined, operator, set));
            } else {
                parts.push(joined);
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                return;
            }
            let joined = map
                .iter()
                .flat_map(|(key, item)| {
                    [encode(key, set), encode(&scalar_text(item, None), set)]
                })
                .collect::<Vec<_>>()
                .join(",");
            if operator.named() {
                parts.push(named_pair(&spec.name, &joined, operator, set));
            } else {
                parts.push(joined);
            }
        }
        scalar => {
            let text = scalar_text(scalar, spec.prefix);
            // Label expansion drops empty values outright (no trailing dot).
            if text.is_empty() && operator == Operator::Label {
                return;
            }
            let encoded = encode(&text, set);
            if operator.named() {
                parts.push(named_pair(&spec.name, &encoded, operator, set));
            } else {
                parts.push(encoded);
            }
        }
    }
}

fn named_pair(name: &str, encoded_value: &str, operator: Operator, set: &'static AsciiSet) -> String {
    let name = encode(name, set);
    if encoded_value.is_empty() {
        format!("{name}{}", operator.empty_suffix())
    } else {
        format!("{name}={encoded_value}")
    }
}

/// String form of a scalar value, with optional `:N` truncation (applied
/// to characters, before encoding).
fn scalar_text(value: &Value, prefix: Option<usize>) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        // Nested composites inside an exploded composite flatten to their
        // JSON text; templates addressing resources never nest this deep.
        other => other.to_string(),
    };
    match prefix {
        Some(n) => text.chars().take(n).collect(),
        None => text,
    }
}

fn encode(text: &str, set: &'static AsciiSet) -> String {
    utf8_percent_encode(text, set).to_string()
}
