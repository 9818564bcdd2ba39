use http::StatusCode;

/// Reasons a submitted solution is refused.
///
/// `WrongSolution` deliberately carries no detail: hash mismatch, signature
/// mismatch and resource mismatch all look the same to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("solution is wrong")]
    WrongSolution,
    #[error("challenge expired (delta {overshoot_secs}s)")]
    Expired { overshoot_secs: u64 },
    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    /// Server-side misuse (for example an empty secret). Never shown to clients.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl VerifyError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedInput(_) | Self::UnsupportedAlgorithm(_) => StatusCode::BAD_REQUEST,
            Self::WrongSolution | Self::Expired { .. } => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure to open a signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Any structural, encoding or signature problem with the token.
    #[error("invalid signed value")]
    Invalid,
    #[error("failed to encode payload: {0}")]
    Encode(String),
    /// The token authenticated but its payload did not match the expected type.
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("internal failure: {0}")]
    Internal(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Everything the challenge gate can answer a request with besides success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Internal(#[from] Error),
}

impl GateError {
    /// Maps the failure onto the response status.
    ///
    /// - Malformed input / unsupported algorithm: 400
    /// - Wrong or expired solution: 401
    /// - Everything else: 500
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Verify(err) => err.status_code(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text safe to hand to the client.
    pub fn public_detail(&self) -> &'static str {
        match self {
            Self::Verify(VerifyError::MalformedInput(_))
            | Self::Verify(VerifyError::UnsupportedAlgorithm(_)) => "invalid challenge response",
            Self::Verify(VerifyError::Internal(_)) | Self::Internal(_) => "internal server error",
            Self::Verify(_) => "incorrect challenge response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        assert_eq!(
            VerifyError::MalformedInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            VerifyError::UnsupportedAlgorithm("MD5".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(VerifyError::WrongSolution.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            VerifyError::Expired { overshoot_secs: 3 }.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GateError::from(Error::Internal("secret missing".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = GateError::from(Error::Internal("hmac key is empty".into()));
        assert!(!err.public_detail().contains("hmac"));
    }

    #[test]
    fn expired_reports_overshoot() {
        let err = VerifyError::Expired { overshoot_secs: 42 };
        assert_eq!(err.to_string(), "challenge expired (delta 42s)");
    }
}
