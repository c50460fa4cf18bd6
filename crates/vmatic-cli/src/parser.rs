use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vmatic_core::keys;

use crate::ast::{BlockKind, Directive, Function, Metadata, Node, Script};
use crate::error::ScriptError;

/// Deepest allowed `<include>` chain; a cycle is caught earlier, this bounds
/// pathological-but-acyclic nesting.
const MAX_INCLUDE_DEPTH: usize = 16;

/// Parses a duration argument: `500ms`, `2s`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

/// Parses script text into a [`Script`].
///
/// `origin` is the path the text was read from; it anchors relative
/// `<include>` paths and seeds the metadata source name. All includes are
/// resolved and spliced here, function bodies are pre-parsed, and every
/// `<call>` target is checked, so nothing about the script's shape can fail
/// later than this function.
pub fn parse_script(source: &str, origin: Option<&Path>) -> Result<Script, ScriptError> {
    let mut parser = Parser::new(origin);
    if let Some(path) = origin {
        if let Ok(canonical) = path.canonicalize() {
            parser.include_stack.push(canonical);
        }
    }
    let nodes = parser.parse_source(source)?;

    validate_calls(&nodes, &parser.functions)?;
    for function in parser.functions.values() {
        validate_calls(&function.body, &parser.functions)?;
    }

    Ok(Script {
        nodes,
        variables: parser.variables,
        functions: parser.functions,
        metadata: parser.metadata,
    })
}

// ---------------------------------------------------------------------------
// Line scanning
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    lines: &'a [(usize, &'a str)],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next(&mut self) -> Option<(usize, &'a str)> {
        let item = self.lines.get(self.pos).copied();
        self.pos += 1;
        item
    }
}

/// How a body of lines stopped parsing.
#[derive(Debug)]
enum Terminator {
    Eof,
    Else,
    End,
    EndFunction,
}

/// Classified form of a single non-blank line.
enum LineItem {
    Node(Node),
    OpenBlock { kind: BlockKind, line: usize },
    Else { line: usize },
    End { line: usize },
    FunctionDef { name: String, line: usize },
    EndFunction { line: usize },
    Include { path: String, line: usize },
    Skip,
}

/// A lexed directive argument.
struct Arg {
    value: String,
    quoted: bool,
}

struct Parser {
    functions: HashMap<String, Function>,
    variables: HashMap<String, String>,
    metadata: Metadata,
    include_stack: Vec<PathBuf>,
    base_dir: Option<PathBuf>,
}

impl Parser {
    fn new(origin: Option<&Path>) -> Self {
        Self {
            functions: HashMap::new(),
            variables: HashMap::new(),
            metadata: Metadata {
                source: origin.map(|p| p.display().to_string()),
                ..Metadata::default()
            },
            include_stack: Vec::new(),
            base_dir: origin.and_then(|p| p.parent()).map(|p| p.to_path_buf()),
        }
    }

    fn parse_source(&mut self, source: &str) -> Result<Vec<Node>, ScriptError> {
        let lines: Vec<(usize, &str)> = source
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .collect();
        self.metadata.total_lines += lines.len();

        let mut cursor = Cursor { lines: &lines, pos: 0 };
        let (nodes, terminator) = self.parse_sequence(&mut cursor, 0, false)?;
        // Depth 0 outside a function can only stop at end of input; stray
        // terminators are rejected inside parse_sequence.
        debug_assert!(matches!(terminator, Terminator::Eof));
        Ok(nodes)
    }

    /// Parses lines until a terminator for the current nesting level.
    ///
    /// Conditional and loop blocks close on `<end>`, implicitly at end of
    /// input, and implicitly when `<end-function>` closes the surrounding
    /// function; `<else>` terminates a conditional body and starts its else
    /// branch. Implicit closes propagate the terminator outward so every
    /// enclosing level stops too.
    fn parse_sequence(
        &mut self,
        cursor: &mut Cursor<'_>,
        depth: usize,
        in_function: bool,
    ) -> Result<(Vec<Node>, Terminator), ScriptError> {
        let mut nodes = Vec::new();

        while let Some((number, text)) = cursor.next() {
            match self.classify_line(number, text)? {
                LineItem::Skip => {}
                LineItem::Node(node) => nodes.push(node),
                LineItem::Include { path, line } => {
                    let spliced = self.parse_include(&path, line)?;
                    nodes.extend(spliced);
                }
                LineItem::OpenBlock { kind, line } => {
                    let (node, terminator) =
                        self.parse_block(cursor, kind, line, depth, in_function)?;
                    nodes.push(node);
                    match terminator {
                        None => {}
                        Some(t) => return Ok((nodes, t)),
                    }
                }
                LineItem::Else { line } => {
                    if depth == 0 {
                        return Err(ScriptError::Parse {
                            message: "<else> outside a conditional block".into(),
                            line,
                        });
                    }
                    return Ok((nodes, Terminator::Else));
                }
                LineItem::End { line } => {
                    if depth == 0 {
                        return Err(ScriptError::Parse {
                            message: "<end> with no open block".into(),
                            line,
                        });
                    }
                    return Ok((nodes, Terminator::End));
                }
                LineItem::EndFunction { line } => {
                    if !in_function {
                        return Err(ScriptError::Parse {
                            message: "<end-function> outside a function".into(),
                            line,
                        });
                    }
                    return Ok((nodes, Terminator::EndFunction));
                }
                LineItem::FunctionDef { name, line } => {
                    if depth > 0 || in_function {
                        return Err(ScriptError::Parse {
                            message: format!(
                                "function \"{name}\" defined inside another block"
                            ),
                            line,
                        });
                    }
                    self.parse_function(cursor, name, line)?;
                }
            }
        }

        Ok((nodes, Terminator::Eof))
    }

    /// Parses one block's body (and optional else branch) after its opening
    /// directive was consumed. Returns the block node plus the terminator to
    /// propagate when the block was closed implicitly.
    fn parse_block(
        &mut self,
        cursor: &mut Cursor<'_>,
        kind: BlockKind,
        line: usize,
        depth: usize,
        in_function: bool,
    ) -> Result<(Node, Option<Terminator>), ScriptError> {
        let is_conditional =
            matches!(kind, BlockKind::IfFound { .. } | BlockKind::IfNotFound { .. });

        let (body, terminator) = self.parse_sequence(cursor, depth + 1, in_function)?;

        let (else_body, terminator) = match terminator {
            Terminator::Else => {
                if !is_conditional {
                    return Err(ScriptError::Parse {
                        message: format!("<else> inside {}", kind.summary()),
                        line,
                    });
                }
                let (else_body, t) = self.parse_sequence(cursor, depth + 1, in_function)?;
                if matches!(t, Terminator::Else) {
                    return Err(ScriptError::Parse {
                        message: "duplicate <else> in conditional block".into(),
                        line,
                    });
                }
                (Some(else_body), t)
            }
            other => (None, other),
        };

        let node = Node::Block {
            kind,
            body,
            else_body,
            line,
        };
        let propagate = match terminator {
            Terminator::End => None,
            Terminator::Eof => Some(Terminator::Eof),
            Terminator::EndFunction => Some(Terminator::EndFunction),
            Terminator::Else => unreachable!("else handled above"),
        };
        Ok((node, propagate))
    }

    fn parse_function(
        &mut self,
        cursor: &mut Cursor<'_>,
        name: String,
        line: usize,
    ) -> Result<(), ScriptError> {
        if self.functions.contains_key(&name) {
            return Err(ScriptError::DuplicateFunction { name, line });
        }

        let (body, terminator) = self.parse_sequence(cursor, 0, true)?;
        if !matches!(terminator, Terminator::EndFunction) {
            return Err(ScriptError::Parse {
                message: format!("function \"{name}\" is missing <end-function>"),
                line,
            });
        }

        let arity = body_arity(&body);
        self.functions.insert(
            name.clone(),
            Function {
                name,
                body,
                line,
                arity,
            },
        );
        Ok(())
    }

    fn parse_include(&mut self, path: &str, line: usize) -> Result<Vec<Node>, ScriptError> {
        if self.include_stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(ScriptError::Include {
                path: path.to_string(),
                line,
                message: "include nesting too deep".into(),
            });
        }

        let resolved = match (&self.base_dir, Path::new(path).is_absolute()) {
            (Some(base), false) => base.join(path),
            _ => PathBuf::from(path),
        };
        let canonical = resolved.canonicalize().map_err(|e| ScriptError::Include {
            path: path.to_string(),
            line,
            message: e.to_string(),
        })?;

        if self.include_stack.contains(&canonical) {
            return Err(ScriptError::CircularInclude {
                path: path.to_string(),
                line,
            });
        }

        let source = std::fs::read_to_string(&canonical).map_err(|e| ScriptError::Include {
            path: path.to_string(),
            line,
            message: e.to_string(),
        })?;

        let previous_base = self.base_dir.clone();
        self.base_dir = canonical.parent().map(|p| p.to_path_buf());
        self.include_stack.push(canonical.clone());

        let result = self.parse_source(&source);

        self.include_stack.pop();
        self.base_dir = previous_base;

        result.map_err(|e| match e {
            // Keep named include errors; wrap plain parse failures so the
            // user sees which file they came from.
            err @ (ScriptError::Include { .. } | ScriptError::CircularInclude { .. }) => err,
            other => ScriptError::Include {
                path: path.to_string(),
                line,
                message: other.to_string(),
            },
        })
    }

    // -----------------------------------------------------------------------
    // Line classification
    // -----------------------------------------------------------------------

    fn classify_line(&mut self, line: usize, text: &str) -> Result<LineItem, ScriptError> {
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return Ok(LineItem::Skip);
        }
        if let Some(rest) = trimmed.strip_prefix("\\#") {
            self.metadata.text_lines += 1;
            return Ok(LineItem::Node(Node::Text {
                content: format!("#{rest}"),
                line,
            }));
        }
        if trimmed.starts_with('#') {
            return Ok(LineItem::Skip);
        }
        if let Some(rest) = trimmed.strip_prefix("\\<") {
            self.metadata.text_lines += 1;
            return Ok(LineItem::Node(Node::Text {
                content: format!("<{rest}"),
                line,
            }));
        }
        if trimmed.starts_with('<') {
            self.metadata.directive_lines += 1;
            return self.classify_directive(line, trimmed);
        }
        if let Some((name, value)) = split_assignment(trimmed) {
            self.metadata.variable_lines += 1;
            self.variables
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
            return Ok(LineItem::Node(Node::Assign {
                name: name.to_string(),
                value: value.to_string(),
                line,
            }));
        }

        self.metadata.text_lines += 1;
        Ok(LineItem::Node(Node::Text {
            content: trimmed.to_string(),
            line,
        }))
    }

    fn classify_directive(&mut self, line: usize, trimmed: &str) -> Result<LineItem, ScriptError> {
        let inner = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| ScriptError::Parse {
                message: format!("directive is missing closing '>': {trimmed}"),
                line,
            })?;

        let (name, tail) = match inner.split_once(char::is_whitespace) {
            Some((name, tail)) => (name, tail.trim()),
            None => (inner, ""),
        };
        if name.is_empty() {
            return Err(ScriptError::Parse {
                message: "empty directive".into(),
                line,
            });
        }

        let args = lex_args(tail, line)?;

        match name {
            "wait" => {
                let duration = require_duration(&args, 0, name, line)?;
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Wait(duration),
                    line,
                }))
            }
            "watch" => {
                let query = require_quoted(&args, 0, name, line)?;
                let timeout = require_duration(&args, 1, name, line)?;
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Watch { query, timeout },
                    line,
                }))
            }
            "if-found" | "if-not-found" => {
                let query = require_quoted(&args, 0, name, line)?;
                let timeout = require_duration(&args, 1, name, line)?;
                let kind = if name == "if-found" {
                    BlockKind::IfFound { query, timeout }
                } else {
                    BlockKind::IfNotFound { query, timeout }
                };
                Ok(LineItem::OpenBlock { kind, line })
            }
            "while-found" | "while-not-found" => {
                let query = require_quoted(&args, 0, name, line)?;
                let timeout = require_duration(&args, 1, name, line)?;
                let poll = parse_poll_clause(&args, 2, name, line)?;
                let kind = if name == "while-found" {
                    BlockKind::WhileFound { query, timeout, poll }
                } else {
                    BlockKind::WhileNotFound { query, timeout, poll }
                };
                Ok(LineItem::OpenBlock { kind, line })
            }
            "retry" | "repeat" => {
                let count = require_count(&args, 0, name, line)?;
                let kind = if name == "retry" {
                    BlockKind::Retry(count)
                } else {
                    BlockKind::Repeat(count)
                };
                Ok(LineItem::OpenBlock { kind, line })
            }
            "console" => {
                let number = args
                    .first()
                    .and_then(|a| a.value.parse::<i64>().ok())
                    .ok_or_else(|| ScriptError::Parse {
                        message: "<console> expects a console number".into(),
                        line,
                    })?;
                if !(1..=6).contains(&number) {
                    return Err(ScriptError::InvalidConsole { number, line });
                }
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Console(number as u8),
                    line,
                }))
            }
            "screenshot" => {
                let path = require_quoted(&args, 0, name, line)?;
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Screenshot { path },
                    line,
                }))
            }
            "exit" => {
                let code = match args.first() {
                    None => 0,
                    Some(arg) => arg.value.parse::<i32>().map_err(|_| ScriptError::Parse {
                        message: format!("<exit> expects a numeric code, got \"{}\"", arg.value),
                        line,
                    })?,
                };
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Exit(code),
                    line,
                }))
            }
            "break" => Ok(LineItem::Node(Node::Directive {
                directive: Directive::Break,
                line,
            })),
            "call" => {
                let target = args.first().ok_or_else(|| ScriptError::Parse {
                    message: "<call> expects a function name".into(),
                    line,
                })?;
                let call_args = args[1..].iter().map(|a| a.value.clone()).collect();
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Call {
                        name: target.value.clone(),
                        args: call_args,
                    },
                    line,
                }))
            }
            "include" => {
                let path = require_quoted(&args, 0, name, line)?;
                Ok(LineItem::Include { path, line })
            }
            "function" => {
                let target = args.first().ok_or_else(|| ScriptError::Parse {
                    message: "<function> expects a name".into(),
                    line,
                })?;
                if !is_identifier(&target.value) {
                    return Err(ScriptError::Parse {
                        message: format!("invalid function name \"{}\"", target.value),
                        line,
                    });
                }
                Ok(LineItem::FunctionDef {
                    name: target.value.clone(),
                    line,
                })
            }
            "end-function" => Ok(LineItem::EndFunction { line }),
            "end" => Ok(LineItem::End { line }),
            "else" => Ok(LineItem::Else { line }),
            _ => {
                if !args.is_empty() {
                    return Err(ScriptError::Parse {
                        message: format!("directive <{name}> does not take arguments"),
                        line,
                    });
                }
                let chord = keys::parse_chord(name).map_err(|_| ScriptError::Parse {
                    message: format!("unknown directive or key: <{name}>"),
                    line,
                })?;
                Ok(LineItem::Node(Node::Directive {
                    directive: Directive::Key(chord),
                    line,
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Argument lexing and helpers
// ---------------------------------------------------------------------------

/// Splits a directive argument tail into tokens: double-quoted strings (with
/// `\"`, `\\`, `\n`, `\t` escapes) or bare whitespace-delimited words.
fn lex_args(tail: &str, line: usize) -> Result<Vec<Arg>, ScriptError> {
    let mut args = Vec::new();
    let mut chars = tail.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some('"') => value.push('"'),
                        Some('\\') => value.push('\\'),
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                        }
                        None => {
                            return Err(ScriptError::Parse {
                                message: "unterminated string argument".into(),
                                line,
                            })
                        }
                    },
                    Some('"') => break,
                    Some(other) => value.push(other),
                    None => {
                        return Err(ScriptError::Parse {
                            message: "unterminated string argument".into(),
                            line,
                        })
                    }
                }
            }
            args.push(Arg { value, quoted: true });
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
            args.push(Arg { value, quoted: false });
        }
    }

    Ok(args)
}

fn require_quoted(args: &[Arg], index: usize, name: &str, line: usize) -> Result<String, ScriptError> {
    match args.get(index) {
        Some(arg) if arg.quoted => Ok(arg.value.clone()),
        Some(arg) => Err(ScriptError::Parse {
            message: format!("<{name}> expects a quoted string, got {}", arg.value),
            line,
        }),
        None => Err(ScriptError::Parse {
            message: format!("<{name}> is missing its string argument"),
            line,
        }),
    }
}

fn require_duration(args: &[Arg], index: usize, name: &str, line: usize) -> Result<Duration, ScriptError> {
    let arg = args.get(index).ok_or_else(|| ScriptError::Parse {
        message: format!("<{name}> is missing its duration argument"),
        line,
    })?;
    parse_duration(&arg.value).ok_or_else(|| ScriptError::Parse {
        message: format!("<{name}> has a non-numeric duration: \"{}\"", arg.value),
        line,
    })
}

fn require_count(args: &[Arg], index: usize, name: &str, line: usize) -> Result<u32, ScriptError> {
    let arg = args.get(index).ok_or_else(|| ScriptError::Parse {
        message: format!("<{name}> is missing its count argument"),
        line,
    })?;
    let count: u32 = arg.value.parse().map_err(|_| ScriptError::Parse {
        message: format!("<{name}> has a non-numeric count: \"{}\"", arg.value),
        line,
    })?;
    if count == 0 {
        return Err(ScriptError::Parse {
            message: format!("<{name}> count must be at least 1"),
            line,
        });
    }
    Ok(count)
}

/// Parses the optional `poll Ps` clause of `while-*` directives.
fn parse_poll_clause(
    args: &[Arg],
    index: usize,
    name: &str,
    line: usize,
) -> Result<Option<Duration>, ScriptError> {
    match args.get(index) {
        None => Ok(None),
        Some(keyword) if keyword.value == "poll" => {
            let duration = require_duration(args, index + 1, name, line)?;
            Ok(Some(duration))
        }
        Some(other) => Err(ScriptError::Parse {
            message: format!("<{name}> has an unexpected argument: \"{}\"", other.value),
            line,
        }),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `NAME=value` with an identifier name is a variable assignment; everything
/// else with an `=` is just text to type.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    if is_identifier(name) {
        Some((name, value))
    } else {
        None
    }
}

/// Highest `$N` / `${N}` positional parameter referenced in a function body.
fn body_arity(nodes: &[Node]) -> usize {
    fn scan_text(s: &str, max: &mut usize) {
        let bytes = s.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let mut j = i + 1;
                if j < bytes.len() && bytes[j] == b'{' {
                    j += 1;
                }
                let start = j;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if j > start {
                    if let Ok(n) = s[start..j].parse::<usize>() {
                        *max = (*max).max(n);
                    }
                }
                i = j;
            } else {
                i += 1;
            }
        }
    }

    fn scan_nodes(nodes: &[Node], max: &mut usize) {
        for node in nodes {
            match node {
                Node::Text { content, .. } => scan_text(content, max),
                Node::Assign { value, .. } => scan_text(value, max),
                Node::Directive { directive, .. } => match directive {
                    Directive::Watch { query, .. } => scan_text(query, max),
                    Directive::Screenshot { path } => scan_text(path, max),
                    Directive::Call { args, .. } => {
                        for arg in args {
                            scan_text(arg, max);
                        }
                    }
                    _ => {}
                },
                Node::Block { kind, body, else_body, .. } => {
                    match kind {
                        BlockKind::IfFound { query, .. }
                        | BlockKind::IfNotFound { query, .. }
                        | BlockKind::WhileFound { query, .. }
                        | BlockKind::WhileNotFound { query, .. } => scan_text(query, max),
                        _ => {}
                    }
                    scan_nodes(body, max);
                    if let Some(else_nodes) = else_body {
                        scan_nodes(else_nodes, max);
                    }
                }
            }
        }
    }

    let mut max = 0;
    scan_nodes(nodes, &mut max);
    max
}

/// Checks every `<call>` in the tree against the function table.
fn validate_calls(nodes: &[Node], functions: &HashMap<String, Function>) -> Result<(), ScriptError> {
    for node in nodes {
        match node {
            Node::Directive {
                directive: Directive::Call { name, .. },
                line,
            } => {
                if !functions.contains_key(name) {
                    return Err(ScriptError::UndefinedFunction {
                        name: name.clone(),
                        line: *line,
                    });
                }
            }
            Node::Block { body, else_body, .. } => {
                validate_calls(body, functions)?;
                if let Some(else_nodes) = else_body {
                    validate_calls(else_nodes, functions)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
