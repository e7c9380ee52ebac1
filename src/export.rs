use once_cell::sync::Lazy;
use regex::Regex;

// OSC (title, hyperlinks) terminated by BEL or ST, CSI (colors, cursor
// movement), charset selection, then any remaining two-byte escape.
static ESCAPE_SEQUENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?",
        r"|\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b[()*+][0-9A-Za-z]",
        r"|\x1b[78=>@-Z\\-_]",
    ))
    .expect("escape sequence pattern is valid")
});

/// Turns captured terminal output into plain text: escape sequences are
/// removed, CRLF becomes LF, and other control bytes except tab are dropped.
pub fn strip_control_sequences(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let without_escapes = ESCAPE_SEQUENCES.replace_all(&text, "");
    let normalized = without_escapes.replace("\r\n", "\n");
    normalized
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect()
}
