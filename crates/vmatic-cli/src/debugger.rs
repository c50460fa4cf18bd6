use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use vmatic_core::ocr::{Grid, OcrEngine, OcrGeometry};
use vmatic_core::vm::VmConsole;
use vmatic_core::watch;

/// How the debugger decides where to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// No debugging; the executor never pauses.
    Off,
    /// Pause before every node.
    Step,
    /// Pause only at breakpoint lines and `<break>` directives.
    Breakpoints,
    /// Like `Step`, with a full command prompt at each pause.
    Interactive,
}

/// The user's decision at a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    /// Run until the next breakpoint (or the end).
    Continue,
    /// Execute one node, then pause again.
    Step,
    /// Stop the script.
    Abort,
}

/// Read-only snapshot of executor state shown at a pause.
pub struct DebugView<'a> {
    pub line: usize,
    pub summary: String,
    pub variables: &'a HashMap<String, String>,
    /// Active call frames, innermost last, as "name (called at line N)".
    pub call_stack: Vec<String>,
    /// Most recent OCR snapshot, when a watch or conditional ran before the
    /// pause.
    pub grid: Option<&'a Grid>,
}

/// Live screen access for the `ocr` debugger command.
///
/// Holds its own collaborator handles so a refresh is a pure side-query: it
/// cannot touch executor state.
pub struct ScreenProbe {
    vm: Option<Arc<dyn VmConsole>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    geometry: OcrGeometry,
    shot_dir: PathBuf,
}

impl ScreenProbe {
    pub fn new(
        vm: Option<Arc<dyn VmConsole>>,
        ocr: Option<Arc<dyn OcrEngine>>,
        geometry: OcrGeometry,
        shot_dir: PathBuf,
    ) -> Self {
        Self {
            vm,
            ocr,
            geometry,
            shot_dir,
        }
    }

    /// Takes a fresh screenshot and recognizes it, without advancing the
    /// script.
    pub async fn refresh(&self) -> Result<Grid, String> {
        let vm = self.vm.as_ref().ok_or("no VM connection")?;
        let ocr = self.ocr.as_ref().ok_or("no OCR engine configured")?;
        watch::capture_grid(vm, ocr, &self.geometry, &self.shot_dir).await
    }
}

/// Step/breakpoint control layered over the executor's per-node gate.
///
/// The executor asks [`should_pause`](Self::should_pause) before each node
/// and calls [`pause`](Self::pause) when it answers yes; everything else here
/// is bookkeeping for that exchange.
pub struct Debugger {
    mode: DebugMode,
    breakpoints: BTreeSet<usize>,
    /// Print the OCR snapshot at every pause (the `--debug-console` flavor).
    echo_ocr: bool,
    /// Armed in Step/Interactive mode and after a `step` command; cleared by
    /// `continue`.
    stepping: bool,
    pub current_line: usize,
    pub paused: bool,
}

impl Debugger {
    pub fn new(mode: DebugMode) -> Self {
        Self {
            mode,
            breakpoints: BTreeSet::new(),
            echo_ocr: false,
            stepping: matches!(mode, DebugMode::Step | DebugMode::Interactive),
            current_line: 0,
            paused: false,
        }
    }

    pub fn with_breakpoints(mode: DebugMode, lines: impl IntoIterator<Item = usize>) -> Self {
        let mut debugger = Self::new(mode);
        debugger.breakpoints.extend(lines);
        debugger
    }

    pub fn set_echo_ocr(&mut self, echo: bool) {
        self.echo_ocr = echo;
    }

    pub fn enabled(&self) -> bool {
        self.mode != DebugMode::Off
    }

    pub fn add_breakpoint(&mut self, line: usize) {
        self.breakpoints.insert(line);
    }

    pub fn remove_breakpoint(&mut self, line: usize) {
        self.breakpoints.remove(&line);
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = usize> + '_ {
        self.breakpoints.iter().copied()
    }

    /// Whether to pause before the node at `line`. `<break>` directives pause
    /// in every enabled mode.
    pub fn should_pause(&self, line: usize, is_break: bool) -> bool {
        if !self.enabled() {
            return false;
        }
        is_break || self.stepping || self.breakpoints.contains(&line)
    }

    /// Blocks until the user decides how to proceed.
    ///
    /// In `Step` and `Breakpoints` modes a single input line is read: empty
    /// steps, `c` continues, `q` aborts. `Interactive` mode offers the full
    /// command set. A closed stdin always means continue, so unattended runs
    /// cannot hang.
    pub async fn pause(&mut self, view: DebugView<'_>, probe: &ScreenProbe) -> DebugAction {
        self.current_line = view.line;
        self.paused = true;

        eprintln!(
            "[debug] paused at line {} (depth {}): {}",
            view.line,
            view.call_stack.len(),
            view.summary
        );
        if self.echo_ocr {
            match view.grid {
                Some(grid) => eprint!("{grid}"),
                None => eprintln!("[debug] no OCR snapshot yet"),
            }
        }

        let action = if self.mode == DebugMode::Interactive || self.echo_ocr {
            self.interactive_loop(&view, probe).await
        } else {
            self.simple_prompt().await
        };

        self.paused = false;
        debug!(line = view.line, ?action, "debugger resumed");
        action
    }

    async fn simple_prompt(&mut self) -> DebugAction {
        eprintln!("[debug] Enter = step, c = continue, q = abort");
        match read_input_line().await {
            None => {
                self.stepping = false;
                DebugAction::Continue
            }
            Some(input) => match input.trim() {
                "c" => {
                    self.stepping = false;
                    DebugAction::Continue
                }
                "q" => DebugAction::Abort,
                _ => {
                    self.stepping = true;
                    DebugAction::Step
                }
            },
        }
    }

    async fn interactive_loop(&mut self, view: &DebugView<'_>, probe: &ScreenProbe) -> DebugAction {
        eprintln!("[debug] commands: s(tep), c(ontinue), b <line>, d <line>, vars, stack, ocr, q(uit)");
        loop {
            let Some(input) = read_input_line().await else {
                self.stepping = false;
                return DebugAction::Continue;
            };
            let input = input.trim();
            let (command, argument) = match input.split_once(' ') {
                Some((c, a)) => (c, Some(a.trim())),
                None => (input, None),
            };

            match command {
                "" | "s" | "step" => {
                    self.stepping = true;
                    return DebugAction::Step;
                }
                "c" | "continue" => {
                    self.stepping = false;
                    return DebugAction::Continue;
                }
                "q" | "quit" | "abort" => return DebugAction::Abort,
                "b" | "break" => match argument.and_then(|a| a.parse::<usize>().ok()) {
                    Some(line) => {
                        self.add_breakpoint(line);
                        eprintln!("[debug] breakpoint added at line {line}");
                    }
                    None => eprintln!("[debug] usage: b <line>"),
                },
                "d" | "delete" => match argument.and_then(|a| a.parse::<usize>().ok()) {
                    Some(line) => {
                        self.remove_breakpoint(line);
                        eprintln!("[debug] breakpoint removed from line {line}");
                    }
                    None => eprintln!("[debug] usage: d <line>"),
                },
                "vars" | "v" => {
                    let mut names: Vec<&String> = view.variables.keys().collect();
                    names.sort();
                    for name in names {
                        eprintln!("  {name}={}", view.variables[name]);
                    }
                }
                "stack" => {
                    if view.call_stack.is_empty() {
                        eprintln!("[debug] not inside a function");
                    } else {
                        for (i, frame) in view.call_stack.iter().enumerate() {
                            eprintln!("  #{i} {frame}");
                        }
                    }
                }
                "ocr" => match probe.refresh().await {
                    Ok(grid) => eprint!("{grid}"),
                    Err(message) => eprintln!("[debug] OCR refresh failed: {message}"),
                },
                other => eprintln!("[debug] unknown command: {other}"),
            }
        }
    }
}

/// Reads one line from stdin off the async runtime. `None` on EOF.
async fn read_input_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut buffer = String::new();
        match std::io::stdin().read_line(&mut buffer) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(buffer),
        }
    })
    .await
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_mode_never_pauses() {
        let debugger = Debugger::new(DebugMode::Off);
        assert!(!debugger.enabled());
        assert!(!debugger.should_pause(1, false));
        assert!(!debugger.should_pause(1, true));
    }

    #[test]
    fn step_mode_pauses_everywhere() {
        let debugger = Debugger::new(DebugMode::Step);
        assert!(debugger.should_pause(1, false));
        assert!(debugger.should_pause(99, false));
    }

    #[test]
    fn breakpoints_mode_pauses_only_at_breakpoints_and_breaks() {
        let debugger = Debugger::with_breakpoints(DebugMode::Breakpoints, [3, 7]);
        assert!(!debugger.should_pause(1, false));
        assert!(debugger.should_pause(3, false));
        assert!(debugger.should_pause(7, false));
        // <break> directives always pause.
        assert!(debugger.should_pause(5, true));
    }

    #[test]
    fn breakpoints_can_be_added_and_removed() {
        let mut debugger = Debugger::new(DebugMode::Breakpoints);
        debugger.add_breakpoint(10);
        assert!(debugger.should_pause(10, false));
        debugger.remove_breakpoint(10);
        assert!(!debugger.should_pause(10, false));
    }

    #[test]
    fn interactive_mode_starts_stepping() {
        let debugger = Debugger::new(DebugMode::Interactive);
        assert!(debugger.should_pause(1, false));
    }
}
