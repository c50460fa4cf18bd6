use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vmatic_core::keys::{self, KeyChord};
use vmatic_core::ocr::{Grid, OcrEngine, OcrGeometry};
use vmatic_core::vm::VmConsole;
use vmatic_core::watch::{self, WatchSpec, WatchStatus};

use crate::ast::{BlockKind, Directive, Node, Script};
use crate::debugger::{DebugAction, DebugView, Debugger, ScreenProbe};
use crate::error::ScriptError;
use crate::expand::VariableExpander;

/// Hard cap on nested `<call>` frames.
const MAX_CALL_DEPTH: usize = 64;

/// Knobs for one script run.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Wall-clock budget for the whole script; `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Validate and narrate without any VM or OCR I/O.
    pub dry_run: bool,
    /// Default delay between watch poll iterations.
    pub poll_interval: Duration,
    /// Delay between keystrokes when typing text lines.
    pub type_delay: Duration,
    /// OCR training data and console geometry.
    pub geometry: OcrGeometry,
    /// Directory for transient watch screenshots.
    pub shot_dir: PathBuf,
    /// Fail `<call>`s that pass fewer arguments than the body references.
    pub strict_arity: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            dry_run: false,
            poll_interval: watch::DEFAULT_POLL_INTERVAL,
            type_delay: Duration::from_millis(50),
            geometry: OcrGeometry {
                training_data: PathBuf::new(),
                columns: 80,
                rows: 25,
            },
            shot_dir: std::env::temp_dir(),
            strict_arity: false,
        }
    }
}

/// What a finished run looked like.
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub lines_executed: usize,
    pub exit_code: i32,
    pub error: Option<String>,
    /// Final effective variable bindings.
    pub variables: HashMap<String, String>,
}

/// One active `<call>` frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: String,
    pub call_line: usize,
}

/// Control-flow signal threaded through node execution.
enum Flow {
    Continue,
    Exit(i32),
}

/// Walks a parsed [`Script`], expanding variables per node and dispatching
/// to the VM / OCR collaborators.
///
/// Execution is strictly sequential on the caller's task: one node at a
/// time, function calls run to completion before their call site resumes,
/// and the only suspension points are watch polls, `<wait>`, and debugger
/// pauses. The script deadline is re-checked before every node and inside
/// every poll loop, so a timeout aborts within one dispatch or one poll
/// interval regardless of nesting depth.
pub struct ScriptExecutor {
    vm: Option<Arc<dyn VmConsole>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    expander: VariableExpander,
    options: ExecOptions,
    debugger: Debugger,
    start: Instant,
    deadline: Option<Instant>,
    lines_executed: usize,
    call_stack: Vec<Frame>,
    last_grid: Option<Grid>,
}

impl ScriptExecutor {
    pub fn new(
        vm: Option<Arc<dyn VmConsole>>,
        ocr: Option<Arc<dyn OcrEngine>>,
        expander: VariableExpander,
        debugger: Debugger,
        options: ExecOptions,
    ) -> Self {
        Self {
            vm,
            ocr,
            expander,
            options,
            debugger,
            start: Instant::now(),
            deadline: None,
            lines_executed: 0,
            call_stack: Vec::new(),
            last_grid: None,
        }
    }

    /// Runs the script to completion, failure, `<exit>`, or timeout.
    pub async fn execute(&mut self, script: &Script) -> ExecutionResult {
        self.start = Instant::now();
        self.deadline = self.options.timeout.map(|t| self.start + t);
        self.lines_executed = 0;

        let outcome = self.run_nodes(&script.nodes, script).await;

        let (success, exit_code, error) = match outcome {
            Ok(Flow::Continue) => (true, 0, None),
            Ok(Flow::Exit(code)) => (code == 0, code, None),
            Err(e) => (false, e.exit_code(), Some(e.to_string())),
        };

        if let Some(message) = &error {
            warn!(lines = self.lines_executed, %message, "script failed");
        } else {
            info!(lines = self.lines_executed, exit_code, "script finished");
        }

        ExecutionResult {
            success,
            lines_executed: self.lines_executed,
            exit_code,
            error,
            variables: self.expander.snapshot(),
        }
    }

    fn run_nodes<'a>(
        &'a mut self,
        nodes: &'a [Node],
        script: &'a Script,
    ) -> Pin<Box<dyn Future<Output = Result<Flow, ScriptError>> + 'a>> {
        Box::pin(async move {
            for node in nodes {
                self.check_deadline()?;
                self.debug_gate(node).await?;

                let flow = match node {
                    Node::Text { content, line } => self.run_text(content, *line).await?,
                    Node::Assign { name, value, .. } => {
                        let value = self.expander.expand(value);
                        debug!(name = %name, value = %value, "assign");
                        self.expander.set_var(name.clone(), value);
                        Flow::Continue
                    }
                    Node::Directive { directive, line } => {
                        self.run_directive(directive, *line, script).await?
                    }
                    Node::Block {
                        kind,
                        body,
                        else_body,
                        line,
                    } => {
                        self.run_block(kind, body, else_body.as_deref(), *line, script)
                            .await?
                    }
                };

                self.lines_executed += 1;
                if let Flow::Exit(code) = flow {
                    return Ok(Flow::Exit(code));
                }
            }
            Ok(Flow::Continue)
        })
    }

    // -----------------------------------------------------------------------
    // Leaf nodes
    // -----------------------------------------------------------------------

    async fn run_text(&mut self, content: &str, line: usize) -> Result<Flow, ScriptError> {
        let content = self.expander.expand(content);
        if self.options.dry_run {
            info!(line, text = %content, "dry-run: would type line");
            return Ok(Flow::Continue);
        }
        let vm = self.require_vm(line, &content)?;
        vm.send_string(&content, self.options.type_delay)
            .await
            .map_err(|e| self.vm_failure(line, &content, e))?;
        vm.send_key("ret")
            .await
            .map_err(|e| self.vm_failure(line, &content, e))?;
        Ok(Flow::Continue)
    }

    async fn run_directive(
        &mut self,
        directive: &Directive,
        line: usize,
        script: &Script,
    ) -> Result<Flow, ScriptError> {
        match directive {
            Directive::Key(chord) => {
                self.send_chord(chord, line).await?;
                Ok(Flow::Continue)
            }
            Directive::Wait(duration) => {
                if self.options.dry_run {
                    info!(line, seconds = duration.as_secs_f64(), "dry-run: would wait");
                    return Ok(Flow::Continue);
                }
                let sleep_for = match self.deadline {
                    Some(deadline) => (*duration).min(deadline.duration_since(Instant::now())),
                    None => *duration,
                };
                tokio::time::sleep(sleep_for).await;
                self.check_deadline()?;
                Ok(Flow::Continue)
            }
            Directive::Watch { query, timeout } => {
                let query = self.expander.expand(query);
                if self.options.dry_run {
                    info!(line, query = %query, "dry-run: watch assumed found");
                    return Ok(Flow::Continue);
                }
                let spec = WatchSpec {
                    query: query.clone(),
                    want_present: true,
                    timeout: *timeout,
                    poll_interval: self.options.poll_interval,
                    ignore_case: false,
                };
                let (matched, elapsed) = self.poll_condition(spec, line).await?;
                if matched {
                    Ok(Flow::Continue)
                } else {
                    Err(ScriptError::WatchTimeout {
                        line,
                        query,
                        elapsed,
                    })
                }
            }
            Directive::Console(n) => {
                if !(1..=6).contains(n) {
                    return Err(ScriptError::InvalidConsole {
                        number: i64::from(*n),
                        line,
                    });
                }
                self.send_chord(&keys::console_chord(*n), line).await?;
                Ok(Flow::Continue)
            }
            Directive::Screenshot { path } => {
                let path = self.expander.expand(path);
                let path = expand_time_placeholders(&path);
                if self.options.dry_run {
                    info!(line, path = %path, "dry-run: would screenshot");
                    return Ok(Flow::Continue);
                }
                let vm = self.require_vm(line, &path)?;
                vm.screenshot(std::path::Path::new(&path))
                    .await
                    .map_err(|e| self.vm_failure(line, &path, e))?;
                info!(line, path = %path, "screenshot saved");
                Ok(Flow::Continue)
            }
            Directive::Exit(code) => {
                info!(line, code, "script exit requested");
                Ok(Flow::Exit(*code))
            }
            // Pausing happens in the debug gate; with no debugger attached a
            // breakpoint is inert.
            Directive::Break => Ok(Flow::Continue),
            Directive::Call { name, args } => self.run_call(name, args, line, script).await,
        }
    }

    async fn run_call(
        &mut self,
        name: &str,
        args: &[String],
        line: usize,
        script: &Script,
    ) -> Result<Flow, ScriptError> {
        let function = script
            .functions
            .get(name)
            .ok_or_else(|| ScriptError::UndefinedFunction {
                name: name.to_string(),
                line,
            })?;

        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(ScriptError::RecursionLimit {
                name: name.to_string(),
                line,
            });
        }

        let expanded_args: Vec<String> =
            args.iter().map(|a| self.expander.expand(a)).collect();
        if self.options.strict_arity && expanded_args.len() < function.arity {
            return Err(ScriptError::ArityMismatch {
                name: name.to_string(),
                line,
                expected: function.arity,
                given: expanded_args.len(),
            });
        }

        debug!(line, function = %name, args = ?expanded_args, "calling function");
        self.expander.push_frame(expanded_args);
        self.call_stack.push(Frame {
            function: name.to_string(),
            call_line: line,
        });

        let result = self.run_nodes(&function.body, script).await;

        self.call_stack.pop();
        self.expander.pop_frame();
        result
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    async fn run_block(
        &mut self,
        kind: &BlockKind,
        body: &[Node],
        else_body: Option<&[Node]>,
        line: usize,
        script: &Script,
    ) -> Result<Flow, ScriptError> {
        match kind {
            BlockKind::IfFound { query, timeout } | BlockKind::IfNotFound { query, timeout } => {
                let want_present = matches!(kind, BlockKind::IfFound { .. });
                let query = self.expander.expand(query);

                let condition_met = if self.options.dry_run {
                    info!(line, query = %query, "dry-run: condition assumed met");
                    true
                } else {
                    let spec = WatchSpec {
                        query: query.clone(),
                        want_present,
                        timeout: *timeout,
                        poll_interval: self.options.poll_interval,
                        ignore_case: false,
                    };
                    // Timing out here is the "condition false" signal, not an
                    // error.
                    let (matched, _) = self.poll_condition(spec, line).await?;
                    matched
                };

                if condition_met {
                    debug!(line, query = %query, "taking then-branch");
                    self.run_nodes(body, script).await
                } else if let Some(else_nodes) = else_body {
                    debug!(line, query = %query, "taking else-branch");
                    self.run_nodes(else_nodes, script).await
                } else {
                    Ok(Flow::Continue)
                }
            }
            BlockKind::Retry(limit) => {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match self.run_nodes(body, script).await {
                        Ok(flow) => return Ok(flow),
                        Err(e) if attempt < *limit && is_retryable(&e) => {
                            warn!(line, attempt, error = %e, "block failed, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            BlockKind::Repeat(count) => {
                for iteration in 0..*count {
                    debug!(line, iteration, "repeat pass");
                    if let Flow::Exit(code) = self.run_nodes(body, script).await? {
                        return Ok(Flow::Exit(code));
                    }
                }
                Ok(Flow::Continue)
            }
            BlockKind::WhileFound { query, timeout, poll }
            | BlockKind::WhileNotFound { query, timeout, poll } => {
                let want_present = matches!(kind, BlockKind::WhileFound { .. });
                let query = self.expander.expand(query);
                let poll = poll.unwrap_or(self.options.poll_interval);

                if self.options.dry_run {
                    // One pass through the body stands in for the loop; a
                    // polling condition cannot be evaluated without a VM.
                    info!(line, query = %query, "dry-run: loop body runs once");
                    return self.run_nodes(body, script).await;
                }

                let block_deadline = Instant::now() + *timeout;
                loop {
                    self.check_deadline()?;
                    if Instant::now() >= block_deadline {
                        debug!(line, query = %query, "loop timeout reached, exiting loop");
                        return Ok(Flow::Continue);
                    }

                    let spec = WatchSpec::appear(query.clone(), Duration::ZERO);
                    let (present, _) = self.poll_condition(spec, line).await?;
                    if present != want_present {
                        debug!(line, query = %query, "loop condition cleared");
                        return Ok(Flow::Continue);
                    }

                    if let Flow::Exit(code) = self.run_nodes(body, script).await? {
                        return Ok(Flow::Exit(code));
                    }

                    let sleep_for = match self.deadline {
                        Some(deadline) => poll
                            .min(deadline.duration_since(Instant::now()))
                            .min(block_deadline.duration_since(Instant::now())),
                        None => poll.min(block_deadline.duration_since(Instant::now())),
                    };
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Collaborator plumbing
    // -----------------------------------------------------------------------

    /// Runs the shared polling loop and maps its terminal states: satisfied
    /// and timed-out become a boolean for the caller to interpret, crossing
    /// the script deadline becomes [`ScriptError::ScriptTimeout`].
    async fn poll_condition(
        &mut self,
        spec: WatchSpec,
        line: usize,
    ) -> Result<(bool, Duration), ScriptError> {
        let vm = self.require_vm(line, &spec.query)?;
        let ocr = self
            .ocr
            .clone()
            .ok_or_else(|| ScriptError::VmFailure {
                line,
                content: spec.query.clone(),
                message: "no OCR engine configured (set --ocr-command)".into(),
            })?;

        let status = watch::run_watch(
            &vm,
            &ocr,
            &self.options.geometry,
            &spec,
            self.deadline,
            &self.options.shot_dir,
        )
        .await;

        match status {
            WatchStatus::Satisfied(outcome) => {
                self.last_grid = outcome.grid.or(self.last_grid.take());
                Ok((true, outcome.elapsed))
            }
            WatchStatus::TimedOut(outcome) => {
                self.last_grid = outcome.grid.or(self.last_grid.take());
                Ok((false, outcome.elapsed))
            }
            WatchStatus::Cancelled(_) => Err(ScriptError::ScriptTimeout {
                elapsed: self.start.elapsed(),
            }),
        }
    }

    async fn send_chord(&mut self, chord: &KeyChord, line: usize) -> Result<(), ScriptError> {
        if self.options.dry_run {
            info!(line, chord = %chord, "dry-run: would press");
            return Ok(());
        }
        let description = chord.to_string();
        let vm = self.require_vm(line, &description)?;
        let result = if chord.is_combo() {
            vm.send_combo(&chord.keys).await
        } else {
            vm.send_key(&chord.keys[0]).await
        };
        result.map_err(|e| self.vm_failure(line, &description, e))
    }

    fn require_vm(&self, line: usize, content: &str) -> Result<Arc<dyn VmConsole>, ScriptError> {
        self.vm.clone().ok_or_else(|| ScriptError::VmFailure {
            line,
            content: content.to_string(),
            message: "no VM connection (set --connect, or use --dry-run)".into(),
        })
    }

    fn vm_failure(
        &self,
        line: usize,
        content: &str,
        error: vmatic_core::vm::VmError,
    ) -> ScriptError {
        ScriptError::VmFailure {
            line,
            content: content.to_string(),
            message: error.to_string(),
        }
    }

    fn check_deadline(&self) -> Result<(), ScriptError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ScriptError::ScriptTimeout {
                    elapsed: self.start.elapsed(),
                });
            }
        }
        Ok(())
    }

    async fn debug_gate(&mut self, node: &Node) -> Result<(), ScriptError> {
        if !self.debugger.enabled() {
            return Ok(());
        }
        let line = node.line();
        let is_break = matches!(
            node,
            Node::Directive {
                directive: Directive::Break,
                ..
            }
        );
        if !self.debugger.should_pause(line, is_break) {
            return Ok(());
        }

        let variables = self.expander.snapshot();
        let call_stack = self
            .call_stack
            .iter()
            .map(|f| format!("{} (called at line {})", f.function, f.call_line))
            .collect();
        let view = DebugView {
            line,
            summary: node.summary(),
            variables: &variables,
            call_stack,
            grid: self.last_grid.as_ref(),
        };
        let probe = ScreenProbe::new(
            self.vm.clone(),
            self.ocr.clone(),
            self.options.geometry.clone(),
            self.options.shot_dir.clone(),
        );

        match self.debugger.pause(view, &probe).await {
            DebugAction::Continue | DebugAction::Step => Ok(()),
            DebugAction::Abort => Err(ScriptError::Aborted { line }),
        }
    }
}

/// Whether a failed `<retry>` pass is worth another attempt: transport
/// failures and watch timeouts are; timeouts, aborts, and exits are not.
fn is_retryable(error: &ScriptError) -> bool {
    matches!(
        error,
        ScriptError::VmFailure { .. } | ScriptError::WatchTimeout { .. }
    )
}

/// Expands `{timestamp}`, `{date}`, `{time}`, `{datetime}`, and `{unix}`
/// placeholders in a screenshot path at execution time.
fn expand_time_placeholders(path: &str) -> String {
    let now = chrono::Local::now();
    path.replace("{timestamp}", &now.format("%Y%m%d%H%M%S").to_string())
        .replace("{date}", &now.format("%Y-%m-%d").to_string())
        .replace("{time}", &now.format("%H%M%S").to_string())
        .replace("{datetime}", &now.format("%Y-%m-%d_%H%M%S").to_string())
        .replace("{unix}", &now.timestamp().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use vmatic_core::ocr::OcrError;
    use vmatic_core::vm::VmError;

    use crate::debugger::DebugMode;
    use crate::parser::parse_script;

    /// VM stub that records every operation.
    struct RecordingVm {
        log: Mutex<Vec<String>>,
        fail_sends: Mutex<u32>,
    }

    impl RecordingVm {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                fail_sends: Mutex::new(0),
            })
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn typed_lines(&self) -> Vec<String> {
            self.entries()
                .iter()
                .filter_map(|e| e.strip_prefix("string:").map(|s| s.to_string()))
                .collect()
        }

        /// Make the next `count` send operations fail.
        fn fail_next(&self, count: u32) {
            *self.fail_sends.lock().unwrap() = count;
        }

        fn take_failure(&self) -> bool {
            let mut remaining = self.fail_sends.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl VmConsole for RecordingVm {
        async fn send_key(&self, name: &str) -> Result<(), VmError> {
            if self.take_failure() {
                return Err(VmError::CommandFailed("injected".into()));
            }
            self.log.lock().unwrap().push(format!("key:{name}"));
            Ok(())
        }
        async fn send_combo(&self, keys: &[String]) -> Result<(), VmError> {
            if self.take_failure() {
                return Err(VmError::CommandFailed("injected".into()));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("combo:{}", keys.join("+")));
            Ok(())
        }
        async fn send_string(&self, text: &str, _delay: Duration) -> Result<(), VmError> {
            if self.take_failure() {
                return Err(VmError::CommandFailed("injected".into()));
            }
            self.log.lock().unwrap().push(format!("string:{text}"));
            Ok(())
        }
        async fn screenshot(&self, output: &Path) -> Result<(), VmError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("shot:{}", output.display()));
            std::fs::write(output, b"P6").ok();
            Ok(())
        }
    }

    /// OCR stub yielding a scripted sequence of screens, repeating the last.
    struct SequenceOcr {
        screens: Vec<Grid>,
        calls: AtomicU32,
    }

    impl SequenceOcr {
        fn new(screens: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                screens: screens
                    .into_iter()
                    .map(|s| Grid::new(vec![s.to_string()]))
                    .collect(),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrEngine for SequenceOcr {
        async fn recognize(&self, _image: &Path, _geometry: &OcrGeometry) -> Result<Grid, OcrError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self
                .screens
                .get(n)
                .or_else(|| self.screens.last())
                .cloned()
                .unwrap_or_default())
        }
    }

    fn executor(
        vm: Option<Arc<dyn VmConsole>>,
        ocr: Option<Arc<dyn OcrEngine>>,
        options: ExecOptions,
    ) -> ScriptExecutor {
        ScriptExecutor::new(
            vm,
            ocr,
            VariableExpander::new(),
            Debugger::new(DebugMode::Off),
            options,
        )
    }

    fn options_with_shot_dir(dir: &Path) -> ExecOptions {
        ExecOptions {
            shot_dir: dir.to_path_buf(),
            type_delay: Duration::ZERO,
            ..ExecOptions::default()
        }
    }

    fn parse(source: &str) -> Script {
        parse_script(source, None).unwrap()
    }

    #[tokio::test]
    async fn text_line_is_typed_then_entered() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&parse("echo hello\n")).await;

        assert!(result.success);
        assert_eq!(
            vm.entries(),
            vec!["string:echo hello".to_string(), "key:ret".to_string()]
        );
    }

    #[tokio::test]
    async fn assignment_then_expansion() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec
            .execute(&parse("USER=${USER:-admin}\necho $USER\n"))
            .await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo admin".to_string()]);
        assert_eq!(result.variables.get("USER").unwrap(), "admin");
    }

    #[tokio::test]
    async fn function_call_binds_positionals() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let script = parse("<function greet>\necho hi $1\n<end-function>\n<call greet world>\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo hi world".to_string()]);
    }

    #[tokio::test]
    async fn positionals_are_call_local_but_variables_are_global() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let script = parse(
            "<function setup>\nRESULT=$1\n<end-function>\n<call setup done>\necho $RESULT [$1]\n",
        );
        let result = exec.execute(&script).await;

        assert!(result.success);
        // RESULT persists after the call; $1 does not.
        assert_eq!(vm.typed_lines(), vec!["echo done []".to_string()]);
    }

    #[tokio::test]
    async fn strict_arity_rejects_short_calls() {
        let script = parse("<function f>\necho $1 $2\n<end-function>\n<call f only>\n");
        let vm = RecordingVm::new();
        let mut exec = executor(
            Some(vm.clone()),
            None,
            ExecOptions {
                strict_arity: true,
                ..ExecOptions::default()
            },
        );
        let result = exec.execute(&script).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("expects 2 argument"));
    }

    #[tokio::test]
    async fn lenient_arity_binds_empty() {
        let script = parse("<function f>\necho [$1][$2]\n<end-function>\n<call f only>\n");
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo [only][]".to_string()]);
    }

    #[tokio::test]
    async fn exit_directive_stops_everything() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let script = parse("<repeat 5>\necho pass\n<exit 0>\n<end>\necho never\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(vm.typed_lines(), vec!["echo pass".to_string()]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_unsuccessful_but_not_an_error() {
        let mut exec = executor(Some(RecordingVm::new()), None, ExecOptions::default());
        let result = exec.execute(&parse("<exit 3>\n")).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn repeat_runs_exactly_n_times() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&parse("<repeat 3>\necho tick\n<end>\n")).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines().len(), 3);
    }

    #[tokio::test]
    async fn retry_stops_after_first_success() {
        let vm = RecordingVm::new();
        // First send fails, the retry pass succeeds.
        vm.fail_next(1);
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&parse("<retry 3>\necho attempt\n<end>\n")).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo attempt".to_string()]);
    }

    #[tokio::test]
    async fn retry_exhausts_and_surfaces_last_error() {
        let vm = RecordingVm::new();
        vm.fail_next(10);
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&parse("<retry 2>\necho attempt\n<end>\n")).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert!(result.error.unwrap().contains("VM communication failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_retries_failed_watch() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["booting", "ready"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        let result = exec
            .execute(&parse("<retry 2>\n<watch \"ready\" 0s>\n<end>\n"))
            .await;

        assert!(result.success);
        assert_eq!(ocr.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bare_watch_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["still booting"]);
        let started = Instant::now();
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        let result = exec.execute(&parse("<watch \"ready\" 2s>\necho never\n")).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert!(result.error.unwrap().contains("ready"));
        assert!(vm.typed_lines().is_empty());
        // Reported within one poll interval of the 2s watch timeout.
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn if_not_found_takes_then_branch_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["no error here"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        let script = parse("<if-not-found \"error\" 1s>\necho ok\n<else>\necho bad\n<end>\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo ok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn if_found_takes_else_branch_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["nothing of note"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        let script = parse("<if-found \"login:\" 1s>\necho found\n<else>\necho missing\n<end>\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        // Exactly one branch ran.
        assert_eq!(vm.typed_lines(), vec!["echo missing".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_timeout_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["blank"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        // No else branch: the block is simply skipped.
        let script = parse("<if-found \"prompt\" 1s>\necho found\n<end>\necho after\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo after".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn while_not_found_runs_until_text_appears() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["working", "working", "done"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        let script = parse("<while-not-found \"done\" 60s poll 1s>\necho tick\n<end>\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn while_found_timeout_exits_loop_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["working"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            options_with_shot_dir(dir.path()),
        );
        let script = parse("<while-found \"working\" 2s poll 1s>\n<wait 0s>\n<end>\necho after\n");
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo after".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn script_timeout_dominates_wait() {
        let vm = RecordingVm::new();
        let mut exec = executor(
            Some(vm.clone()),
            None,
            ExecOptions {
                timeout: Some(Duration::from_secs(1)),
                ..ExecOptions::default()
            },
        );
        let started = Instant::now();
        let result = exec.execute(&parse("<wait 60s>\necho never\n")).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 124);
        assert!(vm.typed_lines().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn script_timeout_dominates_nested_watch() {
        let dir = tempfile::tempdir().unwrap();
        let vm = RecordingVm::new();
        let ocr = SequenceOcr::new(vec!["blank"]);
        let mut exec = executor(
            Some(vm.clone()),
            Some(ocr.clone()),
            ExecOptions {
                timeout: Some(Duration::from_secs(2)),
                ..options_with_shot_dir(dir.path())
            },
        );
        let script = parse(
            "<function slow>\n<watch \"ready\" 600s>\n<end-function>\n<call slow>\n",
        );
        let started = Instant::now();
        let result = exec.execute(&script).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 124);
        // Aborts within one poll interval of the 2s deadline.
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn console_directive_sends_chord() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&parse("<console 2>\n")).await;

        assert!(result.success);
        assert_eq!(vm.entries(), vec!["combo:ctrl+alt+f2".to_string()]);
    }

    #[tokio::test]
    async fn screenshot_expands_placeholders() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let dir = tempfile::tempdir().unwrap();
        let script_text = format!(
            "<screenshot \"{}/cap-{{date}}.ppm\">\n",
            dir.path().display()
        );
        let result = exec.execute(&parse(&script_text)).await;

        assert!(result.success);
        let entries = vm.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("shot:"));
        assert!(!entries[0].contains('{'), "placeholders left in {entries:?}");
    }

    #[tokio::test]
    async fn dry_run_touches_no_collaborators() {
        let mut exec = executor(
            None,
            None,
            ExecOptions {
                dry_run: true,
                ..ExecOptions::default()
            },
        );
        let script = parse(
            "USER=root\necho $USER\n<enter>\n<watch \"ready\" 5s>\n<if-found \"x\" 1s>\necho inside\n<end>\n<console 3>\n<screenshot \"out.ppm\">\n",
        );
        let result = exec.execute(&script).await;

        assert!(result.success);
        assert!(result.lines_executed >= 7);
    }

    #[tokio::test]
    async fn missing_vm_is_reported_with_line_and_content() {
        let mut exec = executor(None, None, ExecOptions::default());
        let result = exec.execute(&parse("echo hi\n")).await;

        assert!(!result.success);
        let message = result.error.unwrap();
        assert!(message.contains("line 1"));
        assert!(message.contains("echo hi"));
    }

    #[tokio::test]
    async fn vm_error_carries_failing_line() {
        let vm = RecordingVm::new();
        vm.fail_next(1);
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let result = exec.execute(&parse("echo one\n")).await;

        assert!(!result.success);
        let message = result.error.unwrap();
        assert!(message.contains("line 1"));
        assert!(message.contains("injected"));
    }

    #[tokio::test]
    async fn overrides_win_over_script_assignment() {
        let vm = RecordingVm::new();
        let mut expander = VariableExpander::new();
        expander.set_overrides(&["USER=forced".to_string()]).unwrap();
        let mut exec = ScriptExecutor::new(
            Some(vm.clone()),
            None,
            expander,
            Debugger::new(DebugMode::Off),
            ExecOptions::default(),
        );
        let result = exec.execute(&parse("USER=scripted\necho $USER\n")).await;

        assert!(result.success);
        assert_eq!(vm.typed_lines(), vec!["echo forced".to_string()]);
        assert_eq!(result.variables.get("USER").unwrap(), "forced");
    }

    #[tokio::test]
    async fn recursion_limit_guards_self_calls() {
        let vm = RecordingVm::new();
        let mut exec = executor(Some(vm.clone()), None, ExecOptions::default());
        let script = parse("<function loop>\n<call loop>\n<end-function>\n<call loop>\n");
        let result = exec.execute(&script).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("call depth"));
    }
}
