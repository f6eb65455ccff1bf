//! Makes child-process output safe to re-emit as log lines.

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum State {
    Text,
    Escape,
    Csi,
    Osc,
    OscEscape,
    // DCS, SOS, PM and APC strings all run until ST (ESC \).
    Str,
    StrEscape,
}

impl State {
    fn step(self, c: char) -> (State, bool) {
        match self {
            State::Text if c == '\x1b' => (State::Escape, false),
            State::Text => (State::Text, true),
            State::Escape => match c {
                '[' => (State::Csi, false),
                ']' => (State::Osc, false),
                'P' | 'X' | '^' | '_' => (State::Str, false),
                _ => (State::Text, false),
            },
            State::Csi if ('@'..='~').contains(&c) => (State::Text, false),
            State::Csi => (State::Csi, false),
            State::Osc => match c {
                '\x07' => (State::Text, false),
                '\x1b' => (State::OscEscape, false),
                _ => (State::Osc, false),
            },
            State::OscEscape => match c {
                '\\' => (State::Text, false),
                '\x1b' => (State::OscEscape, false),
                _ => (State::Osc, false),
            },
            State::Str if c == '\x1b' => (State::StrEscape, false),
            State::Str => (State::Str, false),
            State::StrEscape => match c {
                '\\' => (State::Text, false),
                '\x1b' => (State::StrEscape, false),
                _ => (State::Str, false),
            },
        }
    }
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut state = State::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        let (next, visible) = state.step(c);
        state = next;
        if !visible || c == '\r' || c == '\n' {
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() || is_bidi_control(c) {
            continue;
        } else {
            out.push(c);
        }
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_colour_and_title_sequences() {
        let got = sanitize_log_line(">>> \u{1b}[32mEmerging\u{1b}[0m \u{1b}]0;emerge\u{7}(1 of 2)");
        assert_eq!(got, ">>> Emerging (1 of 2)");
    }

    #[test]
    fn strips_string_terminated_sequences() {
        assert_eq!(sanitize_log_line("a\u{1b}Pq#0\u{1b}\\b"), "ab");
    }

    #[test]
    fn drops_line_breaks_and_bidi_overrides() {
        assert_eq!(sanitize_log_line("x\ty\r\n\u{202e}z"), "x yz");
    }

    #[test]
    fn truncates_runaway_lines() {
        let got = sanitize_log_line(&"a".repeat(5000));
        assert!(got.ends_with(" ...[truncated]"));
        assert_eq!(got.chars().filter(|c| *c == 'a').count(), 4096);
    }
}
