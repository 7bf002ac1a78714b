//! Control-sequence scrubbing for the transcript.
//!
//! The transcript is matched as plain text, so console virtual-terminal
//! sequences (CSI/SGR codes, OSC window titles, backspaces) have to be
//! stripped before predicates see the bytes. Stripping moves content to the
//! left, so the producer's read cursor has to move with it; [`sanitize`]
//! returns the adjusted cursor alongside the cleaned bytes.
//!
//! For details on the sequences handled here see
//! <https://learn.microsoft.com/en-us/windows/console/console-virtual-terminal-sequences>.

const ESCAPE: char = '\u{1b}';
const BELL: char = '\u{7}';
const BACKSPACE: char = '\u{8}';

/// Remove console escape sequences from a chunk of PTY output.
///
/// `cursor` is a byte index into `input`; the returned cursor indexes the
/// same logical character in the cleaned output. A cursor that pointed at a
/// removed character is clamped to the position where the removal happened;
/// a negative input cursor is passed through unchanged. Pure function: no
/// I/O, no shared state.
///
/// On POSIX this is the identity — the terminal emulator owns screen state
/// there and the transcript is already printable enough for matching. The
/// scrubbing branch exists for Windows ConPTY output, which interleaves
/// window-title and cursor sequences with the text itself. It is a
/// best-effort filter aimed at a readable transcript, not a terminal.
///
/// The caller must only pass chunks that do not end mid-sequence; the
/// producer guarantees this by cleaning up to the last line break only.
#[must_use]
pub fn sanitize(input: &[u8], cursor: isize, posix: bool) -> (Vec<u8>, isize) {
    if posix {
        return (input.to_vec(), cursor);
    }

    let text = String::from_utf8_lossy(input);

    // Most escape sequences end on one of these.
    let is_plain_terminator = |c: char| c.is_ascii_alphabetic() || c == '@';

    let mut result = String::with_capacity(text.len());
    // Input byte position and encoded length of every rune kept so far, so
    // a backspace can retract the right amount.
    let mut kept: Vec<(usize, usize)> = Vec::with_capacity(text.len());

    let mut new_cursor = cursor;
    let mut in_escape = false;
    let mut in_title_escape = false;
    let mut recording_code = false;
    let mut escape_code = String::new();

    let drop_rune = |pos: usize, len: usize, new_cursor: &mut isize| {
        if pos as isize <= cursor {
            *new_cursor -= len as isize;
        }
    };

    for (pos, rune) in text.char_indices() {
        let len = rune.len_utf8();

        // Code recording only means something inside a sequence.
        if !in_escape {
            recording_code = false;
            escape_code.clear();
        }

        if !in_escape && rune == ESCAPE {
            in_escape = true;
            recording_code = true;
            drop_rune(pos, len, &mut new_cursor);
        } else if in_escape && !in_title_escape && (escape_code == "0" || escape_code == "2") {
            // OSC window title; runs until a BEL.
            in_title_escape = true;
            recording_code = false;
            drop_rune(pos, len, &mut new_cursor);
        } else if in_escape && !in_title_escape && is_plain_terminator(rune) {
            in_escape = false;
            drop_rune(pos, len, &mut new_cursor);
        } else if in_title_escape && rune == BELL {
            in_escape = false;
            in_title_escape = false;
            drop_rune(pos, len, &mut new_cursor);
        } else if in_escape && recording_code && rune.is_ascii_digit() {
            escape_code.push(rune);
            drop_rune(pos, len, &mut new_cursor);
        } else if in_escape {
            if rune != ']' {
                recording_code = false;
            }
            drop_rune(pos, len, &mut new_cursor);
        } else if rune == BACKSPACE && !kept.is_empty() {
            // Drop both the backspace and the rune it erases.
            let (prev_pos, prev_len) = kept.pop().unwrap_or((pos, len));
            drop_rune(prev_pos, prev_len, &mut new_cursor);
            drop_rune(pos, len, &mut new_cursor);
            result.truncate(result.len() - prev_len);
        } else {
            result.push(rune);
            kept.push((pos, len));
        }
    }

    // A cursor that sat inside a removed sequence lands where the removal
    // happened; a cursor that was already negative stays untouched.
    if cursor >= 0 && new_cursor < 0 {
        new_cursor = 0;
    }

    (result.into_bytes(), new_cursor)
}

/// Strip carriage returns so CRLF collapses to LF before matching.
#[must_use]
pub fn normalize_line_ends(value: &[u8]) -> Vec<u8> {
    value.iter().copied().filter(|b| *b != b'\r').collect()
}

/// [`normalize_line_ends`] for strings, used to normalize needles the same
/// way the transcript was normalized.
#[must_use]
pub fn normalize_line_ends_str(value: &str) -> String {
    value.replace('\r', "")
}
