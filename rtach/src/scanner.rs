//! Streaming scanners over PTY output.
//!
//! `scan_modes` looks for CSI private-mode set/reset sequences
//! (`ESC [ ? DIGITS (h|l)`) and reports the mode changes observed, in
//! order. `scan_title` looks for OSC window-title sequences
//! (`ESC ] (0|1|2) ; text (BEL | ESC \)`) and returns the most recent
//! title text found. Both scan a single buffer in one pass and hold no
//! state across calls — the caller (the Session) is responsible for
//! folding results into persistent `alt_screen`/`cursor_visible`/title
//! state. A sequence split across two writes is simply not recognized in
//! the write where it's incomplete; this is acceptable because terminals
//! re-emit mode sets and titles on repaint.

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// A private-mode set (`h`) or reset (`l`) observed in a buffer, carrying
/// the numeric mode parameter (e.g. 1049, 47, 25).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub mode: u16,
    pub set: bool,
}

/// Scan `data` for `ESC [ ? <digits>[;<digits>...] (h|l)` sequences.
/// Multiple semicolon-separated parameters in one sequence all take the
/// same set/reset decision. Returns changes in the order they occur.
pub fn scan_modes(data: &[u8]) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESC && i + 2 < data.len() && data[i + 1] == b'[' && data[i + 2] == b'?' {
            let mut j = i + 3;
            let params_start = j;
            while j < data.len() && (data[j].is_ascii_digit() || data[j] == b';') {
                j += 1;
            }
            if j > params_start && j < data.len() && (data[j] == b'h' || data[j] == b'l') {
                let set = data[j] == b'h';
                for param in data[params_start..j].split(|&b| b == b';') {
                    if let Ok(text) = std::str::from_utf8(param) {
                        if let Ok(mode) = text.parse::<u16>() {
                            changes.push(ModeChange { mode, set });
                        }
                    }
                }
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    changes
}

/// Fold a batch of [`ModeChange`]s into the persistent flags the Session
/// tracks. Only mode 1049/47 (alternate screen) and 25 (cursor
/// visibility) are meaningful; others are ignored.
pub fn apply_mode_changes(changes: &[ModeChange], alt_screen: &mut bool, cursor_visible: &mut bool) {
    for change in changes {
        match change.mode {
            1049 | 47 => *alt_screen = change.set,
            25 => *cursor_visible = change.set,
            _ => {}
        }
    }
}

/// Scan `data` for OSC title sequences and return the text of the last
/// complete one found, if any.
pub fn scan_title(data: &[u8]) -> Option<Vec<u8>> {
    let mut last = None;
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESC && i + 1 < data.len() && data[i + 1] == b']' {
            let kind_pos = i + 2;
            if kind_pos < data.len() && matches!(data[kind_pos], b'0' | b'1' | b'2') {
                let semi_pos = kind_pos + 1;
                if semi_pos < data.len() && data[semi_pos] == b';' {
                    let text_start = semi_pos + 1;
                    let mut j = text_start;
                    let mut terminator = None;
                    while j < data.len() {
                        if data[j] == BEL {
                            terminator = Some((j, j));
                            break;
                        }
                        if data[j] == ESC && j + 1 < data.len() && data[j + 1] == b'\\' {
                            terminator = Some((j, j + 1));
                            break;
                        }
                        j += 1;
                    }
                    if let Some((text_end, seq_end)) = terminator {
                        last = Some(data[text_start..text_end].to_vec());
                        i = seq_end + 1;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    last
}
