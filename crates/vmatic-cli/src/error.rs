use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Everything that can go wrong between reading a script and finishing it.
///
/// Parse-time failures abort before any VM I/O; execution-time failures carry
/// the failing line (and where it helps, the line's content) so the script
/// author can find the spot without re-running at debug verbosity.
#[derive(Debug)]
pub enum ScriptError {
    Usage { message: String },
    Parse { message: String, line: usize },
    VariableOverride { entry: String },
    EnvFile { path: PathBuf, message: String },
    Include { path: String, line: usize, message: String },
    CircularInclude { path: String, line: usize },
    DuplicateFunction { name: String, line: usize },
    UndefinedFunction { name: String, line: usize },
    ArityMismatch { name: String, line: usize, expected: usize, given: usize },
    RecursionLimit { name: String, line: usize },
    InvalidConsole { number: i64, line: usize },
    VmFailure { line: usize, content: String, message: String },
    WatchTimeout { line: usize, query: String, elapsed: Duration },
    ScriptTimeout { elapsed: Duration },
    Aborted { line: usize },
    Io(std::io::Error),
}

impl ScriptError {
    /// Process exit code for this failure. The table is part of the CLI
    /// contract: 1 = parse/validation, 2 = fatal directive or VM failure,
    /// 124 = script deadline, 130 = debugger abort, 4 = I/O.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScriptError::Usage { .. }
            | ScriptError::Parse { .. }
            | ScriptError::VariableOverride { .. }
            | ScriptError::EnvFile { .. }
            | ScriptError::Include { .. }
            | ScriptError::CircularInclude { .. }
            | ScriptError::DuplicateFunction { .. }
            | ScriptError::UndefinedFunction { .. }
            | ScriptError::InvalidConsole { .. } => 1,
            ScriptError::ArityMismatch { .. }
            | ScriptError::RecursionLimit { .. }
            | ScriptError::VmFailure { .. }
            | ScriptError::WatchTimeout { .. } => 2,
            ScriptError::ScriptTimeout { .. } => 124,
            ScriptError::Aborted { .. } => 130,
            ScriptError::Io(_) => 4,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Usage { message } => write!(f, "{message}"),
            ScriptError::Parse { message, line } => {
                write!(f, "parse error at line {line}: {message}")
            }
            ScriptError::VariableOverride { entry } => {
                write!(f, "invalid --var override (expected key=value): {entry}")
            }
            ScriptError::EnvFile { path, message } => {
                write!(f, "cannot load env file {}: {message}", path.display())
            }
            ScriptError::Include { path, line, message } => {
                write!(f, "include \"{path}\" at line {line}: {message}")
            }
            ScriptError::CircularInclude { path, line } => {
                write!(f, "circular include of \"{path}\" at line {line}")
            }
            ScriptError::DuplicateFunction { name, line } => {
                write!(f, "function \"{name}\" redefined at line {line}")
            }
            ScriptError::UndefinedFunction { name, line } => {
                write!(f, "call to undefined function \"{name}\" at line {line}")
            }
            ScriptError::ArityMismatch { name, line, expected, given } => {
                write!(
                    f,
                    "function \"{name}\" at line {line} expects {expected} argument(s), got {given}"
                )
            }
            ScriptError::RecursionLimit { name, line } => {
                write!(f, "call depth limit reached in \"{name}\" at line {line}")
            }
            ScriptError::InvalidConsole { number, line } => {
                write!(f, "invalid console number {number} at line {line} (must be 1..6)")
            }
            ScriptError::VmFailure { line, content, message } => {
                write!(f, "line {line} ({content}): VM communication failed: {message}")
            }
            ScriptError::WatchTimeout { line, query, elapsed } => {
                write!(
                    f,
                    "line {line}: \"{query}\" not seen within {:.1}s",
                    elapsed.as_secs_f64()
                )
            }
            ScriptError::ScriptTimeout { elapsed } => {
                write!(f, "script timeout after {:.1}s", elapsed.as_secs_f64())
            }
            ScriptError::Aborted { line } => {
                write!(f, "aborted by debugger at line {line}")
            }
            ScriptError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<std::io::Error> for ScriptError {
    fn from(e: std::io::Error) -> Self {
        ScriptError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_documented_table() {
        let parse = ScriptError::Parse { message: "x".into(), line: 1 };
        let vm = ScriptError::VmFailure {
            line: 3,
            content: "<enter>".into(),
            message: "gone".into(),
        };
        let watch = ScriptError::WatchTimeout {
            line: 5,
            query: "ready".into(),
            elapsed: Duration::from_secs(2),
        };
        let timeout = ScriptError::ScriptTimeout { elapsed: Duration::from_secs(60) };
        let aborted = ScriptError::Aborted { line: 9 };

        assert_eq!(parse.exit_code(), 1);
        assert_eq!(vm.exit_code(), 2);
        assert_eq!(watch.exit_code(), 2);
        assert_eq!(timeout.exit_code(), 124);
        assert_eq!(aborted.exit_code(), 130);
    }

    #[test]
    fn vm_failure_display_names_line_and_content() {
        let err = ScriptError::VmFailure {
            line: 12,
            content: "echo hello".into(),
            message: "monitor closed".into(),
        };
        let text = err.to_string();
        assert!(text.contains("line 12"));
        assert!(text.contains("echo hello"));
        assert!(text.contains("monitor closed"));
    }
}
