//! SSE wire formatting.

use std::fmt::Write as _;

use super::error::SseResult;
use super::event::SseEvent;

/// Renders [`SseEvent`]s into the `text/event-stream` wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageFormatter;

impl MessageFormatter {
    /// Formats one event as `id:`, `event:`, `retry:` and `data:` lines
    /// followed by a blank line.
    ///
    /// Multi-line payloads produce one `data:` line per line.
    pub fn format(event: &SseEvent) -> SseResult<String> {
        let payload = event.data.render()?;
        let mut out = String::with_capacity(payload.len() + 32);

        if let Some(id) = &event.id {
            let _ = writeln!(out, "id: {id}");
        }
        if let Some(event_type) = &event.event_type {
            let _ = writeln!(out, "event: {event_type}");
        }
        if let Some(retry) = event.retry {
            let _ = writeln!(out, "retry: {retry}");
        }

        for line in split_lines(&payload) {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');

        Ok(out)
    }
}

/// Splits on `\n`, `\r\n` and lone `\r`; a trailing terminator yields a
/// trailing empty line.
fn split_lines(payload: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(payload);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\n', '\r']) {
            Some(pos) => {
                let skip = if current[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[pos + skip..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::event::EventData;
    use serde_json::json;

    #[test]
    fn test_full_event_matches_wire_contract() {
        let event = SseEvent::json(&json!({"value": 5}))
            .unwrap()
            .with_id("1")
            .with_type("count");

        let out = MessageFormatter::format(&event).unwrap();
        assert_eq!(out, "id: 1\nevent: count\ndata: {\"value\": 5}\n\n");
    }

    #[test]
    fn test_multiline_data_is_split() {
        let event = SseEvent::new("Line 1\nLine 2");
        let out = MessageFormatter::format(&event).unwrap();
        assert_eq!(out, "data: Line 1\ndata: Line 2\n\n");
    }

    #[test]
    fn test_crlf_and_cr_are_line_breaks() {
        let event = SseEvent::new("a\r\nb\rc");
        let out = MessageFormatter::format(&event).unwrap();
        assert_eq!(out, "data: a\ndata: b\ndata: c\n\n");
    }

    #[test]
    fn test_trailing_newline_keeps_empty_line() {
        let event = SseEvent::new("a\n");
        let out = MessageFormatter::format(&event).unwrap();
        assert_eq!(out, "data: a\ndata: \n\n");
    }

    #[test]
    fn test_no_event_field_without_type() {
        let out = MessageFormatter::format(&SseEvent::new("x")).unwrap();
        assert!(!out.contains("event:"));
        assert_eq!(out, "data: x\n\n");
    }

    #[test]
    fn test_retry_field_order() {
        let event = SseEvent::new("x").with_retry(3000).with_type("t").with_id("7");
        let out = MessageFormatter::format(&event).unwrap();
        assert_eq!(out, "id: 7\nevent: t\nretry: 3000\ndata: x\n\n");
    }

    #[test]
    fn test_edge_case_payloads() {
        let empty = MessageFormatter::format(&SseEvent::new(EventData::Json(json!({})))).unwrap();
        assert_eq!(empty, "data: {}\n\n");

        let null = MessageFormatter::format(&SseEvent::new(EventData::Json(json!(null)))).unwrap();
        assert_eq!(null, "data: None\n\n");

        let quoted = MessageFormatter::format(&SseEvent::new("\"already\"")).unwrap();
        assert_eq!(quoted, "data: \"already\"\n\n");
    }

    #[test]
    fn test_multiline_json_string_inside_object_stays_on_one_line() {
        let event = SseEvent::json(&json!({"text": "a\nb"})).unwrap();
        let out = MessageFormatter::format(&event).unwrap();
        assert_eq!(out, "data: {\"text\": \"a\\nb\"}\n\n");
    }
}
