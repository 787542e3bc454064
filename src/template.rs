//! Minimal config templating
//!
//! Placeholders are `$name` or `${name}`; `$$` renders a literal `$`. Names are
//! ASCII letters, digits and underscores, not starting with a digit. Rendering
//! is a pure function of the template and the variables, and fails if any
//! placeholder has no bound value.

use std::borrow::Cow;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unresolved placeholder '${name}' at line {line}")]
    Unresolved { name: String, line: usize },

    #[error("invalid placeholder at line {line}, column {column}")]
    Invalid { line: usize, column: usize },
}

/// Source of values for placeholders
pub trait TemplateVars {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>>;
}

impl TemplateVars for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(|v| Cow::Borrowed(v.as_str()))
    }
}

impl TemplateVars for BTreeMap<&str, String> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(|v| Cow::Borrowed(v.as_str()))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Substitute every placeholder in `template` from `vars`
pub fn render(template: &str, vars: &impl TemplateVars) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());

    for (idx, line) in template.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let mut chars = line.char_indices().peekable();

        while let Some((col, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            let invalid = RenderError::Invalid {
                line: line_no,
                column: col + 1,
            };

            let name = match chars.peek().map(|&(_, c)| c) {
                Some('$') => {
                    chars.next();
                    out.push('$');
                    continue;
                }
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, c)) if is_ident_char(c) => name.push(c),
                            _ => return Err(invalid),
                        }
                    }
                    name
                }
                Some(c) if is_ident_start(c) => {
                    let mut name = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if !is_ident_char(c) {
                            break;
                        }
                        name.push(c);
                        chars.next();
                    }
                    name
                }
                _ => return Err(invalid),
            };

            if !name.starts_with(is_ident_start) {
                return Err(invalid);
            }

            let value = vars.lookup(&name).ok_or(RenderError::Unresolved {
                name: name.clone(),
                line: line_no,
            })?;
            out.push_str(&value);
        }
    }

    Ok(out)
}
