use std::borrow::Cow;
use std::collections::BTreeMap;

use encoding_rs::{Encoding, UTF_8};

use crate::SyncError;

/// Converts text between the external source encoding and UTF-8.
///
/// An unset label, or any label resolving to UTF-8, yields the identity codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextCodec {
    encoding: Option<&'static Encoding>,
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::utf8()
    }
}

impl TextCodec {
    #[must_use]
    pub fn utf8() -> Self {
        Self { encoding: None }
    }

    /// Resolve a WHATWG encoding label such as `windows-1252` or `latin1`.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidConfig`] for unknown labels and for encodings
    /// that cannot be written back byte-for-byte (UTF-16 variants, `replacement`).
    pub fn for_label(label: Option<&str>) -> Result<Self, SyncError> {
        let Some(label) = label.map(str::trim).filter(|label| !label.is_empty()) else {
            return Ok(Self::utf8());
        };

        let encoding = Encoding::for_label(label.as_bytes()).ok_or_else(|| {
            SyncError::InvalidConfig(format!("unknown character encoding: {label}"))
        })?;

        if encoding == UTF_8 {
            return Ok(Self::utf8());
        }
        if encoding.output_encoding() != encoding {
            return Err(SyncError::InvalidConfig(format!(
                "character encoding {} cannot be used for the external source",
                encoding.name()
            )));
        }

        Ok(Self { encoding: Some(encoding) })
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.encoding.is_none()
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.encoding.unwrap_or(UTF_8).name()
    }

    /// Encode canonical text into the external encoding.
    ///
    /// # Errors
    /// Returns [`SyncError::Encoding`] when the text holds characters the
    /// external encoding cannot represent.
    pub fn encode<'a>(&self, text: &'a str) -> Result<Cow<'a, [u8]>, SyncError> {
        let Some(encoding) = self.encoding else {
            return Ok(Cow::Borrowed(text.as_bytes()));
        };

        let (bytes, _, had_unmappable) = encoding.encode(text);
        if had_unmappable {
            return Err(SyncError::Encoding(format!(
                "{text:?} is not representable in {}",
                encoding.name()
            )));
        }
        Ok(bytes)
    }

    /// Decode bytes read from the external source into canonical text.
    ///
    /// # Errors
    /// Returns [`SyncError::Encoding`] when the bytes are malformed for the
    /// external encoding.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, SyncError> {
        match self.encoding {
            None => std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|err| SyncError::Encoding(format!("invalid UTF-8 text: {err}"))),
            Some(encoding) => {
                encoding.decode_without_bom_handling_and_without_replacement(bytes).ok_or_else(
                    || SyncError::Encoding(format!("malformed {} byte sequence", encoding.name())),
                )
            }
        }
    }

    /// Encode every value of a row mapping.
    ///
    /// # Errors
    /// Fails on the first value that cannot be encoded.
    pub fn encode_row(
        &self,
        row: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, SyncError> {
        row.iter()
            .map(|(key, value)| Ok((key.clone(), self.encode(value)?.into_owned())))
            .collect()
    }

    /// Decode every value of a row mapping.
    ///
    /// # Errors
    /// Fails on the first value that cannot be decoded, naming its column.
    pub fn decode_row(
        &self,
        row: &BTreeMap<String, Vec<u8>>,
    ) -> Result<BTreeMap<String, String>, SyncError> {
        row.iter()
            .map(|(key, value)| {
                let text = self.decode(value).map_err(|err| match err {
                    SyncError::Encoding(message) => {
                        SyncError::Encoding(format!("column {key}: {message}"))
                    }
                    other => other,
                })?;
                Ok((key.clone(), text.into_owned()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use encoding_rs::{KOI8_R, WINDOWS_1252};
    use proptest::prelude::*;

    use super::*;

    fn codec(label: &str) -> TextCodec {
        match TextCodec::for_label(Some(label)) {
            Ok(codec) => codec,
            Err(err) => panic!("label {label} should resolve: {err}"),
        }
    }

    #[test]
    fn unset_and_utf8_labels_are_identity() -> Result<(), SyncError> {
        assert!(TextCodec::for_label(None)?.is_identity());
        assert!(TextCodec::for_label(Some("  "))?.is_identity());
        assert!(TextCodec::for_label(Some("utf-8"))?.is_identity());
        assert!(TextCodec::for_label(Some("UTF8"))?.is_identity());

        let identity = TextCodec::utf8();
        assert!(matches!(identity.encode("Café")?, Cow::Borrowed(_)));
        assert_eq!(identity.decode("Café".as_bytes())?, "Café");
        Ok(())
    }

    #[test]
    fn latin1_alias_resolves_to_windows_1252() {
        assert_eq!(codec("latin1").name(), "windows-1252");
        assert_eq!(codec("ISO-8859-1").name(), "windows-1252");
    }

    #[test]
    fn unknown_and_unwritable_labels_are_rejected() {
        assert!(matches!(
            TextCodec::for_label(Some("klingon")),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            TextCodec::for_label(Some("utf-16le")),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn windows_1252_encodes_and_decodes_accented_text() -> Result<(), SyncError> {
        let codec = codec("windows-1252");
        let encoded = codec.encode("Café Économie")?;
        assert_eq!(encoded.as_ref(), b"Caf\xe9 \xc9conomie");
        assert_eq!(codec.decode(&encoded)?, "Café Économie");
        Ok(())
    }

    #[test]
    fn unmappable_characters_fail_to_encode() {
        let codec = codec("windows-1252");
        assert!(matches!(codec.encode("日本語"), Err(SyncError::Encoding(_))));
    }

    #[test]
    fn invalid_utf8_fails_to_decode_with_identity_codec() {
        let err = TextCodec::utf8().decode(b"Caf\xe9");
        assert!(matches!(err, Err(SyncError::Encoding(_))));
    }

    #[test]
    fn decode_row_names_the_failing_column() {
        let mut row = BTreeMap::new();
        row.insert("fullname".to_string(), b"Caf\xe9".to_vec());
        match TextCodec::utf8().decode_row(&row) {
            Err(SyncError::Encoding(message)) => assert!(message.contains("fullname")),
            other => panic!("expected encoding error, got {other:?}"),
        }
    }

    #[test]
    fn rows_round_trip_through_batch_helpers() -> Result<(), SyncError> {
        let codec = codec("koi8-r");
        let mut row = BTreeMap::new();
        row.insert("fullname".to_string(), "Физика".to_string());
        row.insert("shortname".to_string(), "PHYS".to_string());

        let encoded = codec.encode_row(&row)?;
        assert_eq!(encoded["shortname"], b"PHYS".to_vec());
        assert_eq!(codec.decode_row(&encoded)?, row);
        Ok(())
    }

    proptest! {
        #[test]
        fn identity_codec_round_trips_any_text(text in "\\PC*") {
            let codec = TextCodec::utf8();
            let encoded = codec.encode(&text).map_err(|err| TestCaseError::fail(err.to_string()))?;
            let decoded = codec.decode(&encoded).map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(decoded.as_ref(), text.as_str());
        }

        #[test]
        fn single_byte_codecs_round_trip_representable_text(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            for (label, encoding) in [("windows-1252", WINDOWS_1252), ("koi8-r", KOI8_R)] {
                let text = encoding.decode_without_bom_handling(&bytes).0.into_owned();
                let codec = codec(label);
                let encoded = codec.encode(&text).map_err(|err| TestCaseError::fail(err.to_string()))?;
                let decoded = codec.decode(&encoded).map_err(|err| TestCaseError::fail(err.to_string()))?;
                prop_assert_eq!(decoded.as_ref(), text.as_str());
            }
        }
    }
}
