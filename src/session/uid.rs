//! The most recently observed tag UID.

/// Text shown before any UID has been received.
pub const NO_UID_TEXT: &str = "no UID yet";

/// Latest UID reported by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UidValue(Option<String>);

impl UidValue {
    /// Decode a characteristic payload.
    ///
    /// The payload is UTF-8 text (invalid bytes are replaced); surrounding
    /// whitespace and trailing NULs are trimmed. An empty result means no UID.
    pub fn from_payload(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if trimmed.is_empty() {
            Self(None)
        } else {
            Self(Some(trimmed.to_string()))
        }
    }

    /// The UID, if one has been received.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Check if no UID is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl std::fmt::Display for UidValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().unwrap_or(NO_UID_TEXT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_uid() {
        let uid = UidValue::from_payload(b"A1B2C3");
        assert_eq!(uid.as_str(), Some("A1B2C3"));
        assert_eq!(uid.to_string(), "A1B2C3");
    }

    #[test]
    fn test_empty_payload() {
        let uid = UidValue::from_payload(b"");
        assert!(uid.is_empty());
        assert_eq!(uid.to_string(), "no UID yet");
    }

    #[test]
    fn test_trimmed() {
        assert_eq!(UidValue::from_payload(b"  04:A2:1F\r\n").as_str(), Some("04:A2:1F"));
        assert_eq!(UidValue::from_payload(b"DEAD\0\0").as_str(), Some("DEAD"));
        assert!(UidValue::from_payload(b" \n ").is_empty());
    }

    #[test]
    fn test_default_is_empty() {
        assert_eq!(UidValue::default().to_string(), NO_UID_TEXT);
    }
}
