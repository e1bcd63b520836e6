//! Decoding of raw child-process output into log lines.

use encoding_rs::{GB18030, GBK};

/// Turns the raw bytes of one output line into text.
///
/// Valid UTF-8 passes through untouched. With the legacy fallback enabled,
/// invalid UTF-8 is retried as GBK and then GB18030; when neither decodes
/// cleanly the bytes are kept with lossy replacement.
#[derive(Debug, Clone, Copy)]
pub struct LineDecoder {
    legacy_fallback: bool,
}

impl LineDecoder {
    pub fn new(legacy_fallback: bool) -> Self {
        Self { legacy_fallback }
    }

    pub fn decode(&self, raw: &[u8]) -> String {
        let text = self.decode_text(raw);
        text.trim_end_matches(&['\r', '\n'][..]).to_string()
    }

    /// Decode a whole buffer, keeping embedded line breaks.
    pub fn decode_text(&self, raw: &[u8]) -> String {
        if let Ok(s) = std::str::from_utf8(raw) {
            return s.to_string();
        }

        if self.legacy_fallback {
            for encoding in [GBK, GB18030] {
                if let Some(s) = encoding.decode_without_bom_handling_and_without_replacement(raw) {
                    return s.into_owned();
                }
            }
        }

        String::from_utf8_lossy(raw).into_owned()
    }
}
