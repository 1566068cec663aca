//! Output truncation for tool results fed back to the model
//!
//! Keeps the head of the output, cut on a line boundary.

/// Result of a truncation operation
pub struct TruncationResult {
    pub text: String,
    pub was_truncated: bool,
    pub bytes_shown: usize,
    pub bytes_total: usize,
}

impl TruncationResult {
    /// Format a truncation notice for appending to output
    pub fn notice(&self) -> Option<String> {
        if !self.was_truncated {
            return None;
        }
        Some(format!(
            "\n[Output truncated: showed {} of {} bytes]",
            self.bytes_shown, self.bytes_total,
        ))
    }

    /// Text with the notice appended when truncated
    pub fn into_output(self) -> String {
        match self.notice() {
            Some(notice) => format!("{}{}", self.text, notice),
            None => self.text,
        }
    }
}

/// Head-truncate to at most `max_bytes`, preferring the last full line.
pub fn truncate_head(text: &str, max_bytes: usize) -> TruncationResult {
    let bytes_total = text.len();
    if bytes_total <= max_bytes {
        return TruncationResult {
            text: text.to_string(),
            was_truncated: false,
            bytes_shown: bytes_total,
            bytes_total,
        };
    }

    let mut limit = max_bytes;
    while limit > 0 && !text.is_char_boundary(limit) {
        limit -= 1;
    }
    let head = &text[..limit];
    // A single oversized line is cut mid-line rather than dropped entirely
    let cutoff = head.rfind('\n').filter(|pos| *pos > 0).unwrap_or(limit);
    let final_text = text[..cutoff].to_string();

    TruncationResult {
        bytes_shown: final_text.len(),
        text: final_text,
        was_truncated: true,
        bytes_total,
    }
}
