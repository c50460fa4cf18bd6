//! # vmatic-core
//!
//! Core library for QEMU console automation over the QEMU Machine Protocol.
//!
//! This crate provides the foundational components for driving a QEMU virtual
//! machine's console: keyboard input over QMP, screenshot capture, OCR-backed
//! screen inspection, and the polling protocol that waits for text to appear
//! on (or disappear from) the guest console.
//!
//! ## Modules
//!
//! - [`vm`] - The [`VmConsole`](vm::VmConsole) capability trait and connection config
//! - [`qmp`] - QMP monitor client implementing [`VmConsole`](vm::VmConsole)
//! - [`keys`] - Key-name catalog, modifier chords, and text-to-keystroke mapping
//! - [`ocr`] - The [`OcrEngine`](ocr::OcrEngine) capability trait and recognized-text grid
//! - [`watch`] - The screenshot → OCR → search polling loop
//! - [`config`] - Persistent defaults in `~/.vmatic/config.json`
//!
//! ## External Dependencies
//!
//! The OCR capability shells out to an external recognizer binary (see
//! [`ocr::CommandOcr`]); screenshot capture requires a QEMU instance with a
//! QMP monitor socket exposed (`-qmp unix:/path,server,nowait`).
//!
//! ## Example
//!
//! ```no_run
//! use vmatic_core::qmp::QmpClient;
//! use vmatic_core::vm::{ConnectConfig, VmConsole};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectConfig::parse("/tmp/qmp.sock")?;
//! let mut client = QmpClient::new(config);
//! client.connect().await?;
//!
//! // Type a command into the guest console
//! client.send_string("uname -a", std::time::Duration::from_millis(50)).await?;
//! client.send_key("ret").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod keys;
pub mod ocr;
pub mod qmp;
pub mod vm;
pub mod watch;
