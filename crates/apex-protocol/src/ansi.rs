use std::sync::OnceLock;

use regex::Regex;

// ─── ANSI stripping ───────────────────────────────────────────────────────

static ANSI_RE: OnceLock<Regex> = OnceLock::new();

fn ansi_re() -> &'static Regex {
    // CSI sequences, OSC sequences (BEL- or ST-terminated), lone two-byte
    // escapes, and stray C0 control bytes other than \n and \t.
    ANSI_RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \x1b\[[0-9;?]*[\x20-\x2f]*[@-~]        # CSI ... final
          | \x1b\][^\x07\x1b]*(?:\x07|\x1b\\)      # OSC ... BEL/ST
          | \x1b[@-Z\\-_]                          # other ESC Fe
          | [\x00-\x08\x0b-\x1f\x7f]               # C0 controls, keep \n \t
            ",
        )
        .expect("ANSI regex is valid")
    })
}

/// Remove ANSI escape sequences and control runs from PTY output.
///
/// The agent CLI runs inside a PTY and decorates its stream-JSON lines with
/// cursor and color sequences; those must go before `serde_json` sees the
/// line. Newlines and tabs survive.
pub fn strip_ansi(input: &str) -> String {
    ansi_re().replace_all(input, "").into_owned()
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_plain_text_through() {
        assert_eq!(strip_ansi("hello world"), "hello world");
    }

    #[test]
    fn strips_color_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m"), "ok");
    }

    #[test]
    fn strips_cursor_and_erase_sequences() {
        assert_eq!(strip_ansi("\x1b[2K\x1b[1G{\"type\":\"x\"}"), "{\"type\":\"x\"}");
    }

    #[test]
    fn strips_osc_title_sequences() {
        assert_eq!(strip_ansi("\x1b]0;my title\x07payload"), "payload");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn strips_carriage_returns_but_keeps_newlines() {
        assert_eq!(strip_ansi("a\r\nb\tc"), "a\nb\tc");
    }

    #[test]
    fn json_line_survives_decoration() {
        let line = "\x1b[?25l{\"type\":\"result\",\"total_cost_usd\":0.01}\x1b[?25h";
        let clean = strip_ansi(line);
        let v: serde_json::Value = serde_json::from_str(&clean).unwrap();
        assert_eq!(v["type"], "result");
    }
}
