//! Key-name catalog and keystroke mapping for the QMP `send-key` command.
//!
//! Script directives name keys the way a user would (`enter`, `esc`,
//! `ctrl+alt+f2`); QMP wants qcode names (`ret`, `esc`, `ctrl`...). This
//! module owns the translation in both directions: named-key lookup, modifier
//! chord parsing, the console-switch chord, and the character-to-keystroke
//! table used when typing whole lines of text.

use std::fmt;

use thiserror::Error;

/// Errors produced while resolving key names.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    /// The name does not correspond to any known key.
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// A chord contained no non-modifier key or was otherwise empty.
    #[error("invalid key chord: {0}")]
    InvalidChord(String),
}

/// One or more keys pressed together, in qcode names.
///
/// A single-key chord maps to a plain `send-key`; a multi-key chord presses
/// all keys simultaneously (modifiers first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChord {
    /// The qcode names, modifiers first.
    pub keys: Vec<String>,
}

impl KeyChord {
    /// A chord holding a single key.
    pub fn single(key: impl Into<String>) -> Self {
        Self {
            keys: vec![key.into()],
        }
    }

    /// Whether this chord involves more than one key.
    pub fn is_combo(&self) -> bool {
        self.keys.len() > 1
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keys.join("+"))
    }
}

/// Resolves a script-facing key name to its QMP qcode name.
///
/// Returns `None` for names that are not a recognized key (the caller
/// decides whether that is a syntax error or an unrelated directive).
pub fn qcode(name: &str) -> Option<&'static str> {
    let code = match name {
        "enter" | "return" | "ret" => "ret",
        "tab" => "tab",
        "esc" | "escape" => "esc",
        "space" | "spc" => "spc",
        "backspace" | "bksp" => "backspace",
        "delete" | "del" => "delete",
        "insert" | "ins" => "insert",
        "up" => "up",
        "down" => "down",
        "left" => "left",
        "right" => "right",
        "home" => "home",
        "end" => "end",
        "pgup" | "pageup" => "pgup",
        "pgdn" | "pagedown" => "pgdn",
        "ctrl" => "ctrl",
        "alt" => "alt",
        "shift" => "shift",
        "meta" | "win" => "meta_l",
        "capslock" => "caps_lock",
        "f1" => "f1",
        "f2" => "f2",
        "f3" => "f3",
        "f4" => "f4",
        "f5" => "f5",
        "f6" => "f6",
        "f7" => "f7",
        "f8" => "f8",
        "f9" => "f9",
        "f10" => "f10",
        "f11" => "f11",
        "f12" => "f12",
        _ => return None,
    };
    Some(code)
}

/// Whether a qcode is a modifier key.
fn is_modifier(code: &str) -> bool {
    matches!(code, "ctrl" | "alt" | "shift" | "meta_l")
}

/// Parses a chord expression like `ctrl+c`, `alt+f4`, or `ctrl+alt+del`.
///
/// Each `+`-separated part is a named key or a single letter/digit. A chord
/// must end in exactly one non-modifier key.
pub fn parse_chord(expr: &str) -> Result<KeyChord, KeyError> {
    let parts: Vec<&str> = expr.split('+').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(KeyError::InvalidChord(expr.to_string()));
    }

    let mut keys = Vec::with_capacity(parts.len());
    for part in &parts {
        let code = resolve_part(part)?;
        keys.push(code);
    }

    let non_modifiers = keys.iter().filter(|k| !is_modifier(k)).count();
    if keys.len() > 1 && non_modifiers != 1 {
        return Err(KeyError::InvalidChord(expr.to_string()));
    }

    Ok(KeyChord { keys })
}

fn resolve_part(part: &str) -> Result<String, KeyError> {
    if let Some(code) = qcode(part) {
        return Ok(code.to_string());
    }
    let mut chars = part.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            return Ok(c.to_string());
        }
    }
    Err(KeyError::UnknownKey(part.to_string()))
}

/// The chord that switches a Linux guest to virtual console `n` (1..=6):
/// `ctrl+alt+fN`.
///
/// Callers validate the range; this function only builds the chord.
pub fn console_chord(n: u8) -> KeyChord {
    KeyChord {
        keys: vec!["ctrl".to_string(), "alt".to_string(), format!("f{n}")],
    }
}

/// Maps a single character to the keystrokes that produce it on a US layout.
///
/// Returns `None` for characters with no mapping; typing such a character is
/// a hard error surfaced to the script author rather than a silent skip.
pub fn char_chord(c: char) -> Option<Vec<&'static str>> {
    let keys: Vec<&'static str> = match c {
        'a'..='z' => vec![letter_code(c)],
        'A'..='Z' => vec!["shift", letter_code(c.to_ascii_lowercase())],
        '0' => vec!["0"],
        '1' => vec!["1"],
        '2' => vec!["2"],
        '3' => vec!["3"],
        '4' => vec!["4"],
        '5' => vec!["5"],
        '6' => vec!["6"],
        '7' => vec!["7"],
        '8' => vec!["8"],
        '9' => vec!["9"],
        ' ' => vec!["spc"],
        '\n' => vec!["ret"],
        '\t' => vec!["tab"],
        '-' => vec!["minus"],
        '=' => vec!["equal"],
        '[' => vec!["bracket_left"],
        ']' => vec!["bracket_right"],
        ';' => vec!["semicolon"],
        '\'' => vec!["apostrophe"],
        '`' => vec!["grave_accent"],
        '\\' => vec!["backslash"],
        ',' => vec!["comma"],
        '.' => vec!["dot"],
        '/' => vec!["slash"],
        '!' => vec!["shift", "1"],
        '@' => vec!["shift", "2"],
        '#' => vec!["shift", "3"],
        '$' => vec!["shift", "4"],
        '%' => vec!["shift", "5"],
        '^' => vec!["shift", "6"],
        '&' => vec!["shift", "7"],
        '*' => vec!["shift", "8"],
        '(' => vec!["shift", "9"],
        ')' => vec!["shift", "0"],
        '_' => vec!["shift", "minus"],
        '+' => vec!["shift", "equal"],
        '{' => vec!["shift", "bracket_left"],
        '}' => vec!["shift", "bracket_right"],
        ':' => vec!["shift", "semicolon"],
        '"' => vec!["shift", "apostrophe"],
        '~' => vec!["shift", "grave_accent"],
        '|' => vec!["shift", "backslash"],
        '<' => vec!["shift", "comma"],
        '>' => vec!["shift", "dot"],
        '?' => vec!["shift", "slash"],
        _ => return None,
    };
    Some(keys)
}

fn letter_code(c: char) -> &'static str {
    match c {
        'a' => "a",
        'b' => "b",
        'c' => "c",
        'd' => "d",
        'e' => "e",
        'f' => "f",
        'g' => "g",
        'h' => "h",
        'i' => "i",
        'j' => "j",
        'k' => "k",
        'l' => "l",
        'm' => "m",
        'n' => "n",
        'o' => "o",
        'p' => "p",
        'q' => "q",
        'r' => "r",
        's' => "s",
        't' => "t",
        'u' => "u",
        'v' => "v",
        'w' => "w",
        'x' => "x",
        'y' => "y",
        'z' => "z",
        _ => unreachable!("letter_code called with non-letter"),
    }
}
