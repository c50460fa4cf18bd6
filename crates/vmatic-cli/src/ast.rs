use std::collections::HashMap;
use std::time::Duration;

use vmatic_core::keys::KeyChord;

/// A parsed script: the node tree plus everything resolved at parse time.
///
/// Immutable after parsing. Function bodies are stored pre-parsed so that
/// every parse error surfaces before execution begins and repeated calls
/// don't re-lex anything.
#[derive(Debug, Clone)]
pub struct Script {
    pub nodes: Vec<Node>,
    /// Script-declared defaults: the first `NAME=value` seen for each name,
    /// unexpanded. Kept for tooling; execution assigns in source order.
    pub variables: HashMap<String, String>,
    pub functions: HashMap<String, Function>,
    pub metadata: Metadata,
}

/// Line-count bookkeeping for `vmatic check` and log output.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Source file name, if the script came from a file.
    pub source: Option<String>,
    /// Every scanned line, including blanks and comments, includes merged in.
    pub total_lines: usize,
    pub text_lines: usize,
    pub directive_lines: usize,
    pub variable_lines: usize,
}

/// A named function body with its definition site.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub body: Vec<Node>,
    pub line: usize,
    /// Highest `$N` positional parameter referenced anywhere in the body.
    pub arity: usize,
}

/// One executable unit, tagged with its 1-based source line.
#[derive(Debug, Clone)]
pub enum Node {
    /// Literal text typed into the console, followed by Enter.
    Text { content: String, line: usize },
    /// `NAME=value`; the value is expanded when the node executes.
    Assign { name: String, value: String, line: usize },
    /// A single non-block directive.
    Directive { directive: Directive, line: usize },
    /// A directive that owns a nested body (and, for conditionals, an
    /// optional else branch).
    Block {
        kind: BlockKind,
        body: Vec<Node>,
        else_body: Option<Vec<Node>>,
        line: usize,
    },
}

impl Node {
    pub fn line(&self) -> usize {
        match self {
            Node::Text { line, .. }
            | Node::Assign { line, .. }
            | Node::Directive { line, .. }
            | Node::Block { line, .. } => *line,
        }
    }

    /// Short description of the node for error messages and the debugger.
    pub fn summary(&self) -> String {
        match self {
            Node::Text { content, .. } => content.clone(),
            Node::Assign { name, value, .. } => format!("{name}={value}"),
            Node::Directive { directive, .. } => directive.summary(),
            Node::Block { kind, .. } => kind.summary(),
        }
    }
}

/// Non-block directives, fully resolved at parse time.
#[derive(Debug, Clone)]
pub enum Directive {
    /// A named key or modifier chord, e.g. `<enter>` or `<ctrl+alt+f2>`.
    Key(KeyChord),
    /// `<wait Ns>`.
    Wait(Duration),
    /// `<watch "text" Ns>`: poll until found; timing out is fatal here.
    Watch { query: String, timeout: Duration },
    /// `<console N>`: switch to virtual console N (1..=6).
    Console(u8),
    /// `<screenshot "path">` with time placeholders expanded at run time.
    Screenshot { path: String },
    /// `<exit N>`: stop the script with the given code.
    Exit(i32),
    /// `<break>`: a debugger breakpoint, inert when not debugging.
    Break,
    /// `<call NAME arg...>`.
    Call { name: String, args: Vec<String> },
}

impl Directive {
    pub fn summary(&self) -> String {
        match self {
            Directive::Key(chord) => format!("<{chord}>"),
            Directive::Wait(d) => format!("<wait {:.1}s>", d.as_secs_f64()),
            Directive::Watch { query, timeout } => {
                format!("<watch \"{query}\" {:.0}s>", timeout.as_secs_f64())
            }
            Directive::Console(n) => format!("<console {n}>"),
            Directive::Screenshot { path } => format!("<screenshot \"{path}\">"),
            Directive::Exit(code) => format!("<exit {code}>"),
            Directive::Break => "<break>".to_string(),
            Directive::Call { name, args } => {
                if args.is_empty() {
                    format!("<call {name}>")
                } else {
                    format!("<call {name} {}>", args.join(" "))
                }
            }
        }
    }
}

/// Block-opening directives.
#[derive(Debug, Clone)]
pub enum BlockKind {
    IfFound { query: String, timeout: Duration },
    IfNotFound { query: String, timeout: Duration },
    /// Re-run the body on failure, up to N passes total.
    Retry(u32),
    /// Run the body exactly N times.
    Repeat(u32),
    WhileFound { query: String, timeout: Duration, poll: Option<Duration> },
    WhileNotFound { query: String, timeout: Duration, poll: Option<Duration> },
}

impl BlockKind {
    pub fn summary(&self) -> String {
        match self {
            BlockKind::IfFound { query, .. } => format!("<if-found \"{query}\">"),
            BlockKind::IfNotFound { query, .. } => format!("<if-not-found \"{query}\">"),
            BlockKind::Retry(n) => format!("<retry {n}>"),
            BlockKind::Repeat(n) => format!("<repeat {n}>"),
            BlockKind::WhileFound { query, .. } => format!("<while-found \"{query}\">"),
            BlockKind::WhileNotFound { query, .. } => format!("<while-not-found \"{query}\">"),
        }
    }
}
