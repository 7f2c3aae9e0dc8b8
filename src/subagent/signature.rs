//! Sub-agent signatures: named registry, string shorthand, validation.
//!
//! A signature is a record of input field names, output field names, and
//! embedded instructions. Pre-built signatures and parsed shorthand strings
//! resolve through the same validator.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub type_name: String,
}

impl Field {
    fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub input_fields: Vec<Field>,
    pub output_fields: Vec<Field>,
    pub instructions: String,
}

impl Signature {
    pub fn input_names(&self) -> Vec<&str> {
        self.input_fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.output_fields.iter().map(|f| f.name.as_str()).collect()
    }
}

const DEEP_REASONING_INSTRUCTIONS: &str = "\
Work in three phases over the provided context.

Phase 1 (recon): read the full context, note its size and format, and locate \
chunk boundaries such as paragraph breaks, section headers, or numbered items. \
Decide which regions could bear on the query.

Phase 2 (filter): split the context along those boundaries in code. Apply a \
deterministic keyword or regex check against the query terms to each chunk. \
For chunks that pass, call llm_query() to pull out the relevant information; \
discard the rest.

Phase 3 (aggregate): gather the llm_query() results and call llm_query() one \
final time to synthesize a single coherent answer. Submit that answer.";

const DEEP_REASONING_MULTI_INSTRUCTIONS: &str = "\
Work in three phases across multiple documents.

Phase 1 (recon): read every document, noting size, format, and chunk \
boundaries (paragraph breaks, section headers, numbered items). Decide which \
documents and regions could bear on the query.

Phase 2 (filter): split each document along its boundaries in code and apply \
a deterministic keyword or regex check against the query terms. For chunks \
that pass, call llm_query() to pull out the relevant information; discard the \
rest.

Phase 3 (aggregate): gather the llm_query() results from every document and \
call llm_query() one final time to synthesize a single coherent answer. \
Submit that answer.";

/// Resolve a name from the registry, or parse shorthand like
/// `"text, labels -> category: str"`.
pub fn resolve(spec: &str) -> BridgeResult<Signature> {
    if let Some(signature) = named(spec) {
        return Ok(signature);
    }
    parse_shorthand(spec)
}

fn named(name: &str) -> Option<Signature> {
    let (inputs, outputs, instructions): (&[Field], &[Field], &str) = match name {
        "search" => (
            &[Field::new("context", "str"), Field::new("query", "str")],
            &[Field::new("answer", "str")],
            "Answer the query from the provided context.",
        ),
        "extract" => (
            &[Field::new("document", "str"), Field::new("fields", "list")],
            &[Field::new("extracted", "dict")],
            "Extract the requested fields from the document.",
        ),
        "classify" => (
            &[Field::new("text", "str"), Field::new("categories", "list")],
            &[
                Field::new("category", "str"),
                Field::new("confidence", "float"),
            ],
            "Classify the text into one of the given categories.",
        ),
        "summarize" => (
            &[Field::new("document", "str")],
            &[Field::new("summary", "str")],
            "Summarize the document, preserving key facts and structure.",
        ),
        "deep_reasoning" => (
            &[Field::new("context", "str"), Field::new("query", "str")],
            &[Field::new("answer", "str")],
            DEEP_REASONING_INSTRUCTIONS,
        ),
        "deep_reasoning_multi" => (
            &[Field::new("documents", "str"), Field::new("query", "str")],
            &[Field::new("answer", "str")],
            DEEP_REASONING_MULTI_INSTRUCTIONS,
        ),
        _ => return None,
    };
    Some(Signature {
        name: name.to_string(),
        input_fields: inputs.to_vec(),
        output_fields: outputs.to_vec(),
        instructions: instructions.to_string(),
    })
}

fn ident_re() -> Regex {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex")
}

fn type_re() -> Regex {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\[[a-zA-Z0-9_,\s\[\]]+\])?$").expect("static regex")
}

fn parse_shorthand(spec: &str) -> BridgeResult<Signature> {
    let invalid = |why: &str| BridgeError::Validation(format!("invalid signature '{spec}': {why}"));

    let (lhs, rhs) = spec
        .split_once("->")
        .ok_or_else(|| invalid("expected 'inputs -> outputs'"))?;

    let input_fields = parse_fields(lhs).map_err(|e| invalid(&e))?;
    let output_fields = parse_fields(rhs).map_err(|e| invalid(&e))?;
    if input_fields.is_empty() {
        return Err(invalid("at least one input field required"));
    }
    if output_fields.is_empty() {
        return Err(invalid("at least one output field required"));
    }

    for input in &input_fields {
        if output_fields.iter().any(|o| o.name == input.name) {
            return Err(invalid(&format!(
                "field '{}' appears on both sides",
                input.name
            )));
        }
    }

    Ok(Signature {
        name: "custom".into(),
        input_fields,
        output_fields,
        instructions: String::new(),
    })
}

/// Split on commas outside brackets, then parse `name[: type]`.
fn parse_fields(side: &str) -> Result<Vec<Field>, String> {
    let ident = ident_re();
    let type_check = type_re();
    let mut fields = Vec::new();

    let mut depth = 0usize;
    let mut current = String::new();
    let mut parts: Vec<String> = Vec::new();
    for c in side.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, type_name) = match part.split_once(':') {
            Some((n, t)) => (n.trim(), t.trim()),
            None => (part, "str"),
        };
        if !ident.is_match(name) {
            return Err(format!("bad field name '{name}'"));
        }
        if !type_check.is_match(type_name) {
            return Err(format!("bad type '{type_name}' for field '{name}'"));
        }
        fields.push(Field::new(name, type_name));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_signatures_resolve() {
        for name in [
            "search",
            "extract",
            "classify",
            "summarize",
            "deep_reasoning",
            "deep_reasoning_multi",
        ] {
            let sig = resolve(name).unwrap();
            assert_eq!(sig.name, name);
            assert!(!sig.input_fields.is_empty());
            assert!(!sig.output_fields.is_empty());
        }
    }

    #[test]
    fn deep_reasoning_carries_three_phases() {
        let sig = resolve("deep_reasoning").unwrap();
        for phase in ["recon", "filter", "aggregate"] {
            assert!(sig.instructions.contains(phase), "missing phase {phase}");
        }
        assert!(sig.instructions.contains("llm_query()"));
    }

    #[test]
    fn shorthand_parses_names_and_types() {
        let sig = resolve("text -> sentiment: str").unwrap();
        assert_eq!(sig.input_names(), vec!["text"]);
        assert_eq!(sig.output_names(), vec!["sentiment"]);
        assert_eq!(sig.output_fields[0].type_name, "str");

        let sig = resolve("input_a, input_b -> output: list[str]").unwrap();
        assert_eq!(sig.input_names(), vec!["input_a", "input_b"]);
        assert_eq!(sig.output_fields[0].type_name, "list[str]");
    }

    #[test]
    fn untyped_fields_default_to_str() {
        let sig = resolve("a, b -> c").unwrap();
        assert!(sig.input_fields.iter().all(|f| f.type_name == "str"));
        assert_eq!(sig.output_fields[0].type_name, "str");
    }

    #[test]
    fn bracketed_types_survive_comma_split() {
        let sig = resolve("doc -> pairs: dict[str, int], count: int").unwrap();
        assert_eq!(sig.output_names(), vec!["pairs", "count"]);
        assert_eq!(sig.output_fields[0].type_name, "dict[str, int]");
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        for bad in [
            "no arrow here",
            "-> out",
            "in ->",
            "1bad -> out",
            "in -> 2bad",
            "x -> x",
            "a, a b -> out",
        ] {
            let err = resolve(bad).unwrap_err();
            assert_eq!(err.kind(), "validation", "{bad} should be rejected");
        }
    }
}
