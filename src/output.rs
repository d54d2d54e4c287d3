//! Separation of a job's return value from its log output
//!
//! A container writes free text and, on one line, its structured return value
//! framed as `RESP|<value>|END`. The framed line is removed from the stream it
//! was found in.

pub const RESULT_PREFIX: &str = "RESP|";
pub const RESULT_SUFFIX: &str = "|END";

/// One output stream split into plain log text and the framed return value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOutput {
    pub text: String,
    pub result: Option<String>,
}

/// Scan `raw` line by line, pulling out the framed return value.
///
/// When several lines carry a frame, the last one wins. Every framed line is
/// dropped from the returned text.
pub fn split_output(raw: &str) -> SplitOutput {
    let mut text = String::with_capacity(raw.len());
    let mut result = None;

    for line in raw.split_inclusive('\n') {
        match extract_result(line) {
            Some(value) => result = Some(value.to_string()),
            None => text.push_str(line),
        }
    }

    SplitOutput { text, result }
}

/// Frame a value the way a container is expected to emit it
pub fn frame_result(value: &str) -> String {
    format!("{}{}{}", RESULT_PREFIX, value, RESULT_SUFFIX)
}

fn extract_result(line: &str) -> Option<&str> {
    let start = line.find(RESULT_PREFIX)? + RESULT_PREFIX.len();
    let end = line[start..].rfind(RESULT_SUFFIX)? + start;
    Some(&line[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_line_becomes_result() {
        let split = split_output("Hello World 1\nRESP|42|END\n");
        assert_eq!(split.text, "Hello World 1\n");
        assert_eq!(split.result.as_deref(), Some("42"));
    }

    #[test]
    fn test_no_marker() {
        let split = split_output("just logs\nmore logs");
        assert_eq!(split.text, "just logs\nmore logs");
        assert_eq!(split.result, None);
    }

    #[test]
    fn test_marker_at_known_offsets() {
        for offset in 0..3 {
            let mut lines: Vec<String> = (0..3).map(|i| format!("log {}", i)).collect();
            lines.insert(offset, frame_result("7"));
            let raw = lines.join("\n");

            let split = split_output(&raw);
            assert_eq!(split.result.as_deref(), Some("7"), "offset {}", offset);
            assert!(!split.text.contains(RESULT_PREFIX));
            assert!(split.text.contains("log 0"));
            assert!(split.text.contains("log 2"));
        }
    }

    #[test]
    fn test_last_marker_wins() {
        let split = split_output("RESP|1|END\nRESP|2|END\n");
        assert_eq!(split.result.as_deref(), Some("2"));
        assert_eq!(split.text, "");
    }

    #[test]
    fn test_value_may_contain_separators() {
        let split = split_output("RESP|{\"a\": \"x|y\"}|END\n");
        assert_eq!(split.result.as_deref(), Some("{\"a\": \"x|y\"}"));
    }

    #[test]
    fn test_empty_value() {
        let split = split_output("RESP||END");
        assert_eq!(split.result.as_deref(), Some(""));
    }

    #[test]
    fn test_unterminated_marker_is_plain_output() {
        let split = split_output("RESP|7\n");
        assert_eq!(split.result, None);
        assert_eq!(split.text, "RESP|7\n");
    }
}
