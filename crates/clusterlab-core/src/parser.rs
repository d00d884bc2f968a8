//! Extraction of the result envelope from raw container output.
//!
//! Parsing never fails from the caller's point of view: anything that does not
//! yield a valid envelope is folded into a degraded failure envelope that
//! carries the raw text, so a misbehaving container cannot surface as an
//! unhandled error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::envelope::ExecutionEnvelope;
use crate::errors::ResultParseError;
use crate::harness::{ENVELOPE_BEGIN, ENVELOPE_END};

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub struct ResultParser;

impl ResultParser {
    /// Best-effort envelope for `raw`; never fails.
    pub fn parse(raw: &str) -> ExecutionEnvelope {
        match Self::try_parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("Degrading container output to a failure envelope: {}", err);
                Self::degraded(raw, &err)
            }
        }
    }

    pub fn try_parse(raw: &str) -> Result<ExecutionEnvelope, ResultParseError> {
        if raw.trim().is_empty() {
            return Err(ResultParseError::Empty);
        }

        let candidate = match Self::between_sentinels(raw)? {
            Some(block) => block,
            None => Self::between_braces(raw).ok_or(ResultParseError::MissingEnvelope)?,
        };

        let envelope: ExecutionEnvelope = serde_json::from_str(candidate.trim())
            .map_err(|e| ResultParseError::Malformed(e.to_string()))?;

        Self::validate_images(&envelope)?;
        Ok(envelope)
    }

    /// The synthesized envelope for a parse failure.
    pub fn degraded(raw: &str, err: &ResultParseError) -> ExecutionEnvelope {
        match err {
            ResultParseError::Empty => ExecutionEnvelope::failure("", err.to_string()),
            _ => ExecutionEnvelope::failure(raw, err.to_string()),
        }
    }

    /// Text between the last begin sentinel line and the end sentinel line
    /// after it.
    ///
    /// Markers only count when they occupy a whole line, so the same strings
    /// appearing inside the JSON (for example in captured `output`) are inert.
    fn between_sentinels(raw: &str) -> Result<Option<&str>, ResultParseError> {
        let mut begin = None;
        let mut offset = 0;
        for line in raw.split_inclusive('\n') {
            offset += line.len();
            if line.trim_end_matches(['\r', '\n']) == ENVELOPE_BEGIN {
                begin = Some(offset);
            }
        }
        let start = match begin {
            Some(start) => start,
            None => return Ok(None),
        };

        let mut offset = start;
        for line in raw[start..].split_inclusive('\n') {
            if line.trim_end_matches(['\r', '\n']) == ENVELOPE_END {
                return Ok(Some(&raw[start..offset]));
            }
            offset += line.len();
        }
        Err(ResultParseError::Malformed(
            "envelope begin marker without end marker".to_string(),
        ))
    }

    /// Fallback for output without sentinels: first `{` through last `}`.
    fn between_braces(raw: &str) -> Option<&str> {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end > start {
            Some(&raw[start..=end])
        } else {
            None
        }
    }

    fn validate_images(envelope: &ExecutionEnvelope) -> Result<(), ResultParseError> {
        for image in envelope.images() {
            let bytes = STANDARD
                .decode(image.data.as_bytes())
                .map_err(|e| ResultParseError::InvalidImage {
                    id: image.id,
                    reason: format!("not base64: {}", e),
                })?;
            if !bytes.starts_with(PNG_SIGNATURE) {
                return Err(ResultParseError::InvalidImage {
                    id: image.id,
                    reason: "not a PNG".to_string(),
                });
            }
        }
        Ok(())
    }
}
