use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::ScriptError;

/// Process environment variables carrying this prefix are imported (prefix
/// stripped) into the expander's environment layer.
pub const ENV_PREFIX: &str = "VMATIC_VAR_";

/// Guard against indirect reference cycles in default expressions.
const MAX_DEPTH: usize = 32;

/// Bash-style `$NAME` / `${NAME...}` expansion over four variable layers.
///
/// Resolution order: command-line overrides, env-file variables, prefixed
/// process environment, then the script's own working set (assignments and
/// `${VAR:=...}` writes). Positional parameters `$1..$N` live on a separate
/// frame stack managed around function calls and shadow nothing.
///
/// Expansion always terminates: a line is scanned once left to right, and
/// default expressions are expanded recursively with a depth cap and an
/// active-name set, so a variable referenced inside its own default resolves
/// to empty instead of looping.
#[derive(Debug, Default)]
pub struct VariableExpander {
    overrides: HashMap<String, String>,
    file_vars: HashMap<String, String>,
    environment: HashMap<String, String>,
    script: HashMap<String, String>,
    positional: Vec<Vec<String>>,
}

impl VariableExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `--var key=value` overrides. An entry without `=` is a
    /// [`ScriptError::VariableOverride`].
    pub fn set_overrides(&mut self, entries: &[String]) -> Result<(), ScriptError> {
        for entry in entries {
            let (name, value) = entry.split_once('=').ok_or_else(|| {
                ScriptError::VariableOverride {
                    entry: entry.clone(),
                }
            })?;
            self.overrides.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Loads `KEY=VALUE` lines from an env file. Blank lines and `#` comments
    /// are ignored; anything else without an `=` is a parse failure.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ScriptError> {
        let content = std::fs::read_to_string(path).map_err(|e| ScriptError::EnvFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, value) = line.split_once('=').ok_or_else(|| ScriptError::EnvFile {
                path: path.to_path_buf(),
                message: format!("line {}: expected KEY=VALUE, got \"{line}\"", index + 1),
            })?;
            let value = value.trim().trim_matches('"').trim_matches('\'');
            self.file_vars
                .insert(name.trim().to_string(), value.to_string());
        }
        Ok(())
    }

    /// Imports `VMATIC_VAR_*` process environment variables. Best-effort; has
    /// no failure mode.
    pub fn load_environment(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                if !name.is_empty() {
                    self.environment.insert(name.to_string(), value);
                }
            }
        }
    }

    /// Sets a variable in the script's working set (plain assignment).
    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.script.insert(name.into(), value.into());
    }

    /// Pushes positional parameters for a function call.
    pub fn push_frame(&mut self, args: Vec<String>) {
        self.positional.push(args);
    }

    /// Pops the innermost positional frame at function return.
    pub fn pop_frame(&mut self) {
        self.positional.pop();
    }

    /// Resolves a name through the layers without expanding anything.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if name.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() {
            let index: usize = name.parse().ok()?;
            if index == 0 {
                return None;
            }
            return self
                .positional
                .last()
                .and_then(|frame| frame.get(index - 1))
                .cloned();
        }
        self.overrides
            .get(name)
            .or_else(|| self.file_vars.get(name))
            .or_else(|| self.environment.get(name))
            .or_else(|| self.script.get(name))
            .cloned()
    }

    /// Expands every variable reference in `line`.
    ///
    /// Unresolvable names expand to the empty string, matching shell
    /// semantics; this is not an error. `${VAR:=default}` writes into the
    /// working set, which is why this takes `&mut self`.
    pub fn expand(&mut self, line: &str) -> String {
        let mut active = HashSet::new();
        self.expand_inner(line, 0, &mut active)
    }

    /// Effective variable bindings, working set shadowed by the outer layers.
    pub fn snapshot(&self) -> HashMap<String, String> {
        let mut merged = self.script.clone();
        for (k, v) in &self.environment {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.file_vars {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.overrides {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    fn expand_inner(&mut self, line: &str, depth: usize, active: &mut HashSet<String>) -> String {
        if depth > MAX_DEPTH {
            return line.to_string();
        }

        let mut result = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'$') => {
                    chars.next();
                    result.push('$');
                }
                '$' => match chars.peek() {
                    Some('{') => {
                        chars.next();
                        match take_braced(&mut chars) {
                            Ok(inner) => {
                                result.push_str(&self.expand_braced(&inner, depth, active));
                            }
                            Err(consumed) => {
                                // Unterminated ${ stays literal.
                                result.push_str("${");
                                result.push_str(&consumed);
                            }
                        }
                    }
                    _ => {
                        let mut name = String::new();
                        while let Some(&c) = chars.peek() {
                            if c.is_ascii_alphanumeric() || c == '_' {
                                name.push(c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        if name.is_empty() {
                            result.push('$');
                        } else {
                            result.push_str(&self.lookup(&name, active));
                        }
                    }
                },
                other => result.push(other),
            }
        }

        result
    }

    fn lookup(&self, name: &str, active: &HashSet<String>) -> String {
        if active.contains(name) {
            return String::new();
        }
        self.resolve(name).unwrap_or_default()
    }

    /// Handles the inside of a `${...}` expression.
    fn expand_braced(&mut self, inner: &str, depth: usize, active: &mut HashSet<String>) -> String {
        let (name, operator) = split_operator(inner);

        let current = if active.contains(name) {
            None
        } else {
            self.resolve(name)
        };
        let is_set = current.as_deref().map_or(false, |v| !v.is_empty());

        match operator {
            None => current.unwrap_or_default(),
            Some((op, expr)) => match op {
                Operator::DefaultTo => {
                    if is_set {
                        current.unwrap_or_default()
                    } else {
                        self.expand_guarded(name, expr, depth, active)
                    }
                }
                Operator::AssignDefault => {
                    if is_set {
                        current.unwrap_or_default()
                    } else {
                        let expanded = self.expand_guarded(name, expr, depth, active);
                        self.script.insert(name.to_string(), expanded.clone());
                        expanded
                    }
                }
                // The variable is set here, so references to it inside the
                // value resolve normally; no self-reference guard needed.
                Operator::IfSet => {
                    if is_set {
                        self.expand_inner(expr, depth + 1, active)
                    } else {
                        String::new()
                    }
                }
            },
        }
    }

    /// Expands `expr` with `name` marked active, so the name resolves to
    /// empty inside its own default. Only the frame that inserted the name
    /// clears it again.
    fn expand_guarded(
        &mut self,
        name: &str,
        expr: &str,
        depth: usize,
        active: &mut HashSet<String>,
    ) -> String {
        let inserted = active.insert(name.to_string());
        let expanded = self.expand_inner(expr, depth + 1, active);
        if inserted {
            active.remove(name);
        }
        expanded
    }
}

#[derive(Debug, Clone, Copy)]
enum Operator {
    /// `${VAR:-default}`
    DefaultTo,
    /// `${VAR:=default}`
    AssignDefault,
    /// `${VAR:+value}`
    IfSet,
}

/// Consumes characters up to the matching `}`, honoring nested `${...}`.
/// When the brace never closes, returns the consumed text as the error so
/// the caller can keep it literal.
fn take_braced(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String, String> {
    let mut inner = String::new();
    let mut depth = 0usize;
    let mut previous = '\0';

    for c in chars.by_ref() {
        match c {
            '{' if previous == '$' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            '}' => return Ok(inner),
            _ => {}
        }
        inner.push(c);
        previous = c;
    }
    Err(inner)
}

/// Splits `NAME:-rest` / `NAME:=rest` / `NAME:+rest` at the first operator.
/// The name part is an identifier, so the first match is the outer operator.
fn split_operator(inner: &str) -> (&str, Option<(Operator, &str)>) {
    let bytes = inner.as_bytes();
    for i in 0..bytes.len().saturating_sub(1) {
        if bytes[i] == b':' {
            let op = match bytes[i + 1] {
                b'-' => Some(Operator::DefaultTo),
                b'=' => Some(Operator::AssignDefault),
                b'+' => Some(Operator::IfSet),
                _ => None,
            };
            if let Some(op) = op {
                return (&inner[..i], Some((op, &inner[i + 2..])));
            }
        }
    }
    (inner, None)
}
