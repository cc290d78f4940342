//! # Template Renderer
//!
//! Pure rendering of `ExternalSecret` templates against resolved field values.
//!
//! Placeholder syntax: `{{ .field }}`, optionally piped through functions:
//! `{{ .password | b64enc }}`, `{{ .user | trim | upper }}`.
//!
//! Supported functions: `b64enc`, `b64dec`, `upper`, `lower`, `trim`.
//! Text outside placeholders is copied verbatim. Rendering has no side effects
//! and identical inputs always produce identical output.

use crate::controller::payload::ResolvedFields;
use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template syntax error at byte {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("template references field '{0}' which is not mapped")]
    MissingField(String),
    #[error("template function '{function}' failed on field '{field}': {reason}")]
    FunctionFailed {
        function: &'static str,
        field: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    B64Enc,
    B64Dec,
    Upper,
    Lower,
    Trim,
}

impl Function {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "b64enc" => Some(Function::B64Enc),
            "b64dec" => Some(Function::B64Dec),
            "upper" => Some(Function::Upper),
            "lower" => Some(Function::Lower),
            "trim" => Some(Function::Trim),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Function::B64Enc => "b64enc",
            Function::B64Dec => "b64dec",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Trim => "trim",
        }
    }

    fn apply(self, field: &str, input: &[u8]) -> Result<Zeroizing<Vec<u8>>, TemplateError> {
        let text = || {
            std::str::from_utf8(input).map_err(|e| TemplateError::FunctionFailed {
                function: self.name(),
                field: field.to_string(),
                reason: format!("value is not valid UTF-8: {e}"),
            })
        };
        let output = match self {
            Function::B64Enc => general_purpose::STANDARD.encode(input).into_bytes(),
            Function::B64Dec => general_purpose::STANDARD.decode(input).map_err(|e| {
                TemplateError::FunctionFailed {
                    function: self.name(),
                    field: field.to_string(),
                    reason: e.to_string(),
                }
            })?,
            Function::Upper => text()?.to_uppercase().into_bytes(),
            Function::Lower => text()?.to_lowercase().into_bytes(),
            Function::Trim => text()?.trim().as_bytes().to_vec(),
        };
        Ok(Zeroizing::new(output))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder {
        field: &'a str,
        functions: Vec<Function>,
    },
}

fn is_field_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn parse_action(inner: &str, position: usize) -> Result<Segment<'_>, TemplateError> {
    let syntax = |message: String| TemplateError::Syntax { position, message };

    if inner.contains(OPEN) {
        return Err(syntax("nested '{{' inside placeholder".to_string()));
    }

    let mut parts = inner.split('|');
    let head = parts.next().unwrap_or_default().trim();
    let field = head
        .strip_prefix('.')
        .ok_or_else(|| syntax(format!("expected '.field', found '{head}'")))?;
    if field.is_empty() {
        return Err(syntax("placeholder has no field name".to_string()));
    }
    if !field.chars().all(is_field_char) {
        return Err(syntax(format!("invalid field name '{field}'")));
    }

    let functions = parts
        .map(|part| {
            let name = part.trim();
            if name.is_empty() {
                return Err(syntax("empty function in pipeline".to_string()));
            }
            Function::parse(name).ok_or_else(|| syntax(format!("unknown function '{name}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Segment::Placeholder { field, functions })
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut offset = 0;

    while let Some(start) = template[offset..].find(OPEN) {
        let open_at = offset + start;
        if open_at > offset {
            segments.push(Segment::Literal(&template[offset..open_at]));
        }
        let inner_start = open_at + OPEN.len();
        let close = template[inner_start..]
            .find(CLOSE)
            .ok_or_else(|| TemplateError::Syntax {
                position: open_at,
                message: "unclosed placeholder".to_string(),
            })?;
        let inner_end = inner_start + close;
        segments.push(parse_action(&template[inner_start..inner_end], open_at)?);
        offset = inner_end + CLOSE.len();
    }

    if offset < template.len() {
        segments.push(Segment::Literal(&template[offset..]));
    }
    Ok(segments)
}

/// Field names referenced by the template, in order of first appearance
///
/// # Errors
/// Returns `TemplateError::Syntax` for malformed placeholders.
pub fn referenced_fields(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut fields: Vec<String> = Vec::new();
    for segment in parse(template)? {
        if let Segment::Placeholder { field, .. } = segment {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
    }
    Ok(fields)
}

/// Render `template` by substituting every placeholder from `values`
///
/// # Errors
/// - `TemplateError::Syntax` for malformed placeholder syntax
/// - `TemplateError::MissingField` if a placeholder names an absent field
/// - `TemplateError::FunctionFailed` if a pipeline function rejects its input
pub fn render(template: &str, values: &ResolvedFields) -> Result<Zeroizing<Vec<u8>>, TemplateError> {
    let segments = parse(template)?;
    let mut output = Zeroizing::new(Vec::with_capacity(template.len()));

    for segment in segments {
        match segment {
            Segment::Literal(text) => output.extend_from_slice(text.as_bytes()),
            Segment::Placeholder { field, functions } => {
                let value = values
                    .get(field)
                    .ok_or_else(|| TemplateError::MissingField(field.to_string()))?;
                let mut current = Zeroizing::new(value.to_vec());
                for function in functions {
                    current = function.apply(field, &current)?;
                }
                output.extend_from_slice(&current);
            }
        }
    }

    Ok(output)
}
