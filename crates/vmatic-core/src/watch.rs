//! The screenshot → OCR → search polling loop.
//!
//! This is the shared core behind the script engine's `watch`, `if-found`,
//! `if-not-found`, `while-found`, and `while-not-found` directives: capture
//! the console, recognize it, check for the query string, and repeat until
//! the condition is met or time runs out.
//!
//! The loop is synchronous within its caller's task: one console is being
//! observed at a time, so there is nothing to parallelize. A transient
//! capture or recognition failure never decides the condition and never
//! aborts the loop; only satisfaction, the watch deadline, or the hard
//! (whole-script) deadline end it. Temporary screenshot files are removed on
//! every exit path, including failed iterations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

use crate::ocr::{Grid, OcrEngine, OcrGeometry};
use crate::vm::VmConsole;

/// Poll interval used when the caller does not configure one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a polling run is looking for.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    /// The substring to search for in the recognized console text.
    pub query: String,
    /// `true` waits for the text to appear; `false` waits for it to be gone.
    pub want_present: bool,
    /// How long to keep polling before giving up.
    pub timeout: Duration,
    /// Delay between poll iterations.
    pub poll_interval: Duration,
    /// Case-insensitive matching.
    pub ignore_case: bool,
}

impl WatchSpec {
    /// A spec that waits for `query` to appear, with the default poll interval.
    pub fn appear(query: impl Into<String>, timeout: Duration) -> Self {
        Self {
            query: query.into(),
            want_present: true,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ignore_case: false,
        }
    }

    /// A spec that waits for `query` to vanish, with the default poll interval.
    pub fn vanish(query: impl Into<String>, timeout: Duration) -> Self {
        Self {
            want_present: false,
            ..Self::appear(query, timeout)
        }
    }
}

/// What happened during a polling run.
#[derive(Debug)]
pub struct WatchOutcome {
    /// Whether the final observation satisfied the condition.
    pub matched: bool,
    /// Wall-clock time spent polling.
    pub elapsed: Duration,
    /// Number of completed poll iterations.
    pub polls: u32,
    /// The last successfully recognized screen, if any iteration succeeded.
    pub grid: Option<Grid>,
}

/// Terminal state of a polling run.
#[derive(Debug)]
pub enum WatchStatus {
    /// The condition was met.
    Satisfied(WatchOutcome),
    /// The watch's own timeout expired with the condition unmet.
    TimedOut(WatchOutcome),
    /// The hard (script-level) deadline expired mid-watch.
    Cancelled(WatchOutcome),
}

/// A per-iteration screenshot file, removed when the guard drops.
struct TempShot {
    path: PathBuf,
}

impl TempShot {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("shot-{}.ppm", Uuid::new_v4())),
        }
    }
}

impl Drop for TempShot {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Capture the console once and recognize it.
///
/// The screenshot file lives only for the duration of the call. Used by the
/// polling loop below and by the debugger's read-only screen refresh.
pub async fn capture_grid(
    vm: &Arc<dyn VmConsole>,
    ocr: &Arc<dyn OcrEngine>,
    geometry: &OcrGeometry,
    shot_dir: &Path,
) -> Result<Grid, String> {
    let shot = TempShot::new(shot_dir);
    vm.screenshot(&shot.path).await.map_err(|e| e.to_string())?;
    ocr.recognize(&shot.path, geometry)
        .await
        .map_err(|e| e.to_string())
}

/// Run the polling loop described in the module docs.
///
/// `hard_deadline` is the whole-script deadline; crossing it yields
/// [`WatchStatus::Cancelled`] within one poll interval, regardless of how
/// much watch time remains.
pub async fn run_watch(
    vm: &Arc<dyn VmConsole>,
    ocr: &Arc<dyn OcrEngine>,
    geometry: &OcrGeometry,
    spec: &WatchSpec,
    hard_deadline: Option<Instant>,
    shot_dir: &Path,
) -> WatchStatus {
    let start = Instant::now();
    let deadline = start + spec.timeout;
    let mut polls: u32 = 0;
    let mut last_grid: Option<Grid> = None;

    loop {
        let observation = {
            let span = debug_span!("watch_poll", query = %spec.query, poll = polls);
            capture_grid(vm, ocr, geometry, shot_dir).instrument(span).await
        };
        polls += 1;

        match observation {
            Ok(grid) => {
                let present = grid.contains(&spec.query, spec.ignore_case);
                last_grid = Some(grid);
                if present == spec.want_present {
                    return WatchStatus::Satisfied(WatchOutcome {
                        matched: true,
                        elapsed: start.elapsed(),
                        polls,
                        grid: last_grid,
                    });
                }
            }
            Err(message) => {
                // A failed capture never decides the condition.
                debug!(%message, "poll iteration failed, continuing");
            }
        }

        let now = Instant::now();
        if let Some(hard) = hard_deadline {
            if now >= hard {
                return WatchStatus::Cancelled(WatchOutcome {
                    matched: false,
                    elapsed: start.elapsed(),
                    polls,
                    grid: last_grid,
                });
            }
        }
        if now >= deadline {
            return WatchStatus::TimedOut(WatchOutcome {
                matched: false,
                elapsed: start.elapsed(),
                polls,
                grid: last_grid,
            });
        }

        tokio::time::sleep(spec.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use crate::ocr::OcrError;
    use crate::vm::VmError;

    /// VM stub that writes an empty file for every screenshot and records
    /// the paths it was asked to write.
    struct StubVm {
        shots: Mutex<Vec<PathBuf>>,
    }

    impl StubVm {
        fn new() -> Self {
            Self {
                shots: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VmConsole for StubVm {
        async fn send_key(&self, _name: &str) -> Result<(), VmError> {
            Ok(())
        }
        async fn send_combo(&self, _keys: &[String]) -> Result<(), VmError> {
            Ok(())
        }
        async fn send_string(&self, _text: &str, _delay: Duration) -> Result<(), VmError> {
            Ok(())
        }
        async fn screenshot(&self, output: &Path) -> Result<(), VmError> {
            std::fs::write(output, b"P6 0 0").unwrap();
            self.shots.lock().unwrap().push(output.to_path_buf());
            Ok(())
        }
    }

    /// OCR stub that yields a scripted sequence of grids, repeating the last.
    struct ScriptedOcr {
        grids: Vec<Grid>,
        calls: AtomicU32,
    }

    impl ScriptedOcr {
        fn new(grids: Vec<Grid>) -> Self {
            Self {
                grids,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl OcrEngine for ScriptedOcr {
        async fn recognize(&self, _image: &Path, _geometry: &OcrGeometry) -> Result<Grid, OcrError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let grid = self
                .grids
                .get(n)
                .or_else(|| self.grids.last())
                .cloned()
                .unwrap_or_default();
            Ok(grid)
        }
    }

    /// OCR stub that always errors.
    struct FailingOcr;

    #[async_trait]
    impl OcrEngine for FailingOcr {
        async fn recognize(&self, _image: &Path, _geometry: &OcrGeometry) -> Result<Grid, OcrError> {
            Err(OcrError::CommandFailed("lost the plot".into()))
        }
    }

    fn geometry() -> OcrGeometry {
        OcrGeometry {
            training_data: PathBuf::from("/dev/null"),
            columns: 80,
            rows: 25,
        }
    }

    fn grid(text: &str) -> Grid {
        Grid::new(vec![text.to_string()])
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_on_first_poll() {
        let vm: Arc<dyn VmConsole> = Arc::new(StubVm::new());
        let ocr: Arc<dyn OcrEngine> = Arc::new(ScriptedOcr::new(vec![grid("system ready")]));
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::appear("ready", Duration::from_secs(5));
        let status = run_watch(&vm, &ocr, &geometry(), &spec, None, dir.path()).await;

        match status {
            WatchStatus::Satisfied(outcome) => {
                assert!(outcome.matched);
                assert_eq!(outcome.polls, 1);
                assert!(outcome.grid.is_some());
            }
            other => panic!("expected Satisfied, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn appears_on_third_poll() {
        let vm: Arc<dyn VmConsole> = Arc::new(StubVm::new());
        let ocr: Arc<dyn OcrEngine> = Arc::new(ScriptedOcr::new(vec![
            grid("booting"),
            grid("booting"),
            grid("login: ready"),
        ]));
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::appear("ready", Duration::from_secs(10));
        let status = run_watch(&vm, &ocr, &geometry(), &spec, None, dir.path()).await;

        match status {
            WatchStatus::Satisfied(outcome) => assert_eq!(outcome.polls, 3),
            other => panic!("expected Satisfied, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_found() {
        let vm: Arc<dyn VmConsole> = Arc::new(StubVm::new());
        let ocr: Arc<dyn OcrEngine> = Arc::new(ScriptedOcr::new(vec![grid("still booting")]));
        let dir = tempfile::tempdir().unwrap();

        let start = Instant::now();
        let spec = WatchSpec::appear("ready", Duration::from_secs(2));
        let status = run_watch(&vm, &ocr, &geometry(), &spec, None, dir.path()).await;

        match status {
            WatchStatus::TimedOut(outcome) => {
                assert!(!outcome.matched);
                // Within one poll-interval tolerance of the 2s timeout.
                assert!(start.elapsed() >= Duration::from_secs(2));
                assert!(start.elapsed() < Duration::from_secs(4));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn vanish_waits_for_absence() {
        let vm: Arc<dyn VmConsole> = Arc::new(StubVm::new());
        let ocr: Arc<dyn OcrEngine> = Arc::new(ScriptedOcr::new(vec![
            grid("error: disk on fire"),
            grid("all clear"),
        ]));
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::vanish("error", Duration::from_secs(10));
        let status = run_watch(&vm, &ocr, &geometry(), &spec, None, dir.path()).await;

        assert!(matches!(status, WatchStatus::Satisfied(o) if o.polls == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_deadline_cancels_before_watch_timeout() {
        let vm: Arc<dyn VmConsole> = Arc::new(StubVm::new());
        let ocr: Arc<dyn OcrEngine> = Arc::new(ScriptedOcr::new(vec![grid("nothing")]));
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::appear("ready", Duration::from_secs(60));
        let hard = Instant::now() + Duration::from_secs(2);
        let status = run_watch(&vm, &ocr, &geometry(), &spec, Some(hard), dir.path()).await;

        assert!(matches!(status, WatchStatus::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn recognition_errors_do_not_satisfy_vanish() {
        // An if-not-found style watch must not treat a failed capture as
        // "the text is gone".
        let vm: Arc<dyn VmConsole> = Arc::new(StubVm::new());
        let ocr: Arc<dyn OcrEngine> = Arc::new(FailingOcr);
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::vanish("error", Duration::from_secs(2));
        let status = run_watch(&vm, &ocr, &geometry(), &spec, None, dir.path()).await;

        assert!(matches!(status, WatchStatus::TimedOut(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn temp_screenshots_are_removed_on_every_path() {
        let vm = Arc::new(StubVm::new());
        let vm_dyn: Arc<dyn VmConsole> = vm.clone();
        let ocr: Arc<dyn OcrEngine> = Arc::new(ScriptedOcr::new(vec![
            grid("booting"),
            grid("ready"),
        ]));
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::appear("ready", Duration::from_secs(10));
        let _ = run_watch(&vm_dyn, &ocr, &geometry(), &spec, None, dir.path()).await;

        let shots = vm.shots.lock().unwrap();
        assert_eq!(shots.len(), 2);
        for path in shots.iter() {
            assert!(!path.exists(), "temp screenshot {path:?} was not removed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn temp_screenshots_removed_when_recognition_fails() {
        let vm = Arc::new(StubVm::new());
        let vm_dyn: Arc<dyn VmConsole> = vm.clone();
        let ocr: Arc<dyn OcrEngine> = Arc::new(FailingOcr);
        let dir = tempfile::tempdir().unwrap();

        let spec = WatchSpec::appear("ready", Duration::from_secs(1));
        let _ = run_watch(&vm_dyn, &ocr, &geometry(), &spec, None, dir.path()).await;

        for path in vm.shots.lock().unwrap().iter() {
            assert!(!path.exists());
        }
    }
}
