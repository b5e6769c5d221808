//! Command-line construction for the export tool.
//!
//! The tool receives a literal token list (no shell is involved). The
//! quoted single-string rendering exists for diagnostics and for callers
//! that must hand the command to a primitive that only accepts one string.

use std::fmt;

use crate::config::ExporterConfig;
use crate::error::ExportError;

/// Substitute positional `{0}`, `{1}`, ... placeholders in `template`.
///
/// `{{` and `}}` produce literal braces. A placeholder whose index has no
/// matching argument, a non-numeric placeholder, or an unbalanced brace is
/// rejected.
pub fn format_query(template: &str, args: &[String]) -> Result<String, ExportError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut index = String::new();
                let mut closed = false;
                for (_, d) in chars.by_ref() {
                    if d == '}' {
                        closed = true;
                        break;
                    }
                    index.push(d);
                }
                if !closed {
                    return Err(ExportError::InvalidQueryTemplate(format!(
                        "unclosed placeholder at offset {pos}"
                    )));
                }
                let n: usize = index.trim().parse().map_err(|_| {
                    ExportError::InvalidQueryTemplate(format!(
                        "placeholder '{{{index}}}' at offset {pos} is not a positional index"
                    ))
                })?;
                let value = args.get(n).ok_or_else(|| {
                    ExportError::InvalidQueryTemplate(format!(
                        "placeholder {{{n}}} has no argument ({} supplied)",
                        args.len()
                    ))
                })?;
                out.push_str(value);
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(ExportError::InvalidQueryTemplate(format!(
                        "unmatched '}}' at offset {pos}"
                    )));
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Wrap `arg` in double quotes, escaping embedded quotes as `\"`.
pub fn quote_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    quoted.push_str(&arg.replace('"', "\\\""));
    quoted.push('"');
    quoted
}

/// A fully built tool invocation.
///
/// Token order: `<query> <subcommand> <destination> <format flags...>
/// <custom flags...> -S <server> -U <username> -P <password>`.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandLine {
    args: Vec<String>,
    /// Index of the password token, masked in `Display`.
    password_index: usize,
}

impl CommandLine {
    /// Build the invocation for `query` exporting to `destination`.
    ///
    /// `query` must already have its positional arguments substituted.
    pub fn build(config: &ExporterConfig, destination: &str, query: &str) -> Self {
        let mut args = Vec::with_capacity(
            9 + config.format_flags.len() + config.custom_args.len(),
        );
        args.push(query.to_string());
        args.push(config.subcommand.clone());
        args.push(destination.to_string());
        args.extend(config.format_flags.iter().cloned());
        args.extend(config.custom_args.iter().cloned());
        args.push("-S".to_string());
        args.push(config.server.clone());
        args.push("-U".to_string());
        args.push(config.username.clone());
        args.push("-P".to_string());
        args.push(config.password.clone());
        let password_index = args.len() - 1;

        Self {
            args,
            password_index,
        }
    }

    /// Literal tokens handed to the process-start primitive.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Single-string rendering with query, destination, server, username
    /// and password quoted and their embedded quotes escaped.
    pub fn render(&self) -> String {
        self.render_with(|i, arg| {
            if self.is_quoted_position(i) {
                quote_arg(arg)
            } else {
                arg.to_string()
            }
        })
    }

    fn is_quoted_position(&self, i: usize) -> bool {
        // query, destination, then the -S, -U and -P values
        i == 0
            || i == 2
            || i == self.password_index - 4
            || i == self.password_index - 2
            || i == self.password_index
    }

    fn render_with(&self, f: impl Fn(usize, &str) -> String) -> String {
        self.args
            .iter()
            .enumerate()
            .map(|(i, arg)| f(i, arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masked = self.render_with(|i, arg| {
            if i == self.password_index {
                "\"***\"".to_string()
            } else if self.is_quoted_position(i) {
                quote_arg(arg)
            } else {
                arg.to_string()
            }
        });
        f.write_str(&masked)
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandLine").field(&self.to_string()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
