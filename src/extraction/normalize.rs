use regex::Regex;
use std::sync::LazyLock;

static HORIZONTAL_RUNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[ \t]+").unwrap_or_else(|error| panic!("invalid whitespace pattern: {error}"))
});
static LINE_BREAKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\n\s*").unwrap_or_else(|error| panic!("invalid line break pattern: {error}"))
});

/// Strip NUL bytes, collapse space/tab runs, squeeze whitespace around line breaks and trim.
///
/// Idempotent: `normalize_text(&normalize_text(s)) == normalize_text(s)`.
pub fn normalize_text(raw: &str) -> String {
    let without_nul = raw.replace('\0', "");
    let collapsed = HORIZONTAL_RUNS.replace_all(&without_nul, " ");
    let lines = LINE_BREAKS.replace_all(&collapsed, "\n");
    lines.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_nul_and_collapses_whitespace() {
        let raw = "  Jane\0 Doe\t\t Senior   Engineer \n\n   Skills:\tRust ,  Go  \r\n\n";
        assert_eq!(
            normalize_text(raw),
            "Jane Doe Senior Engineer\nSkills: Rust , Go"
        );
    }

    #[test]
    fn keeps_single_line_breaks_between_pages() {
        assert_eq!(
            normalize_text("page one\x0c\npage two"),
            "page one\npage two"
        );
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text(" \n\t\0 "), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "a  b\t\tc",
            "\0\0leading nul",
            "x \n \n y\t\n\tz",
            "tabs\tonly\there",
            "mixed\r\n  crlf \r\n lines",
            "non\u{a0}\u{a0}breaking  spaces",
            "  \u{3000}全角\u{3000}空格  \n 简历 ",
            "form\x0cfeed\x0c\x0c",
        ];
        for sample in samples {
            let once = normalize_text(sample);
            assert_eq!(normalize_text(&once), once, "not idempotent for {sample:?}");
        }
    }
}
