use encoding_rs::UTF_8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedReport {
    pub html: String,
    pub encoding_label: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("failed to decode bytes with {encoding}: {message}")]
    DecodeFailure { encoding: String, message: String },
}

/// Decode report bytes: a byte-order mark wins, otherwise strict UTF-8.
pub fn decode_report(bytes: &[u8]) -> Result<DecodedReport, DecodeError> {
    let (text, encoding, had_errors) = UTF_8.decode(bytes);
    if had_errors {
        return Err(DecodeError::DecodeFailure {
            encoding: encoding.name().to_string(),
            message: "malformed byte sequence".into(),
        });
    }
    Ok(DecodedReport {
        html: text.into_owned(),
        encoding_label: encoding.name().to_string(),
    })
}
