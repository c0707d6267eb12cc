mod gemini;
mod openai_compat;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;

/// Strip the SSE framing from one line: `data: {...}` -> `{...}`.
/// Returns `None` for non-data lines (comments, blank keep-alives).
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_strips_frame_prefix() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(sse_data(": keep-alive"), None);
        assert_eq!(sse_data("event: done"), None);
    }
}
