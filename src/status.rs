use std::fmt;

use opentelemetry::trace::Status;

/// Outcome of a traced HTTP request, derived from the response status code.
///
/// The variants mirror the span statuses used by tracing backends that follow
/// the gRPC status taxonomy. A classified status is attached to the request
/// span on finalization; see [`RequestSpanLayer`](crate::RequestSpanLayer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanStatus {
    /// The request completed with a non-error status (`code < 400`).
    Ok,
    /// 403 Forbidden.
    PermissionDenied,
    /// 404 Not Found.
    NotFound,
    /// 429 Too Many Requests.
    ResourceExhausted,
    /// 413 Payload Too Large.
    FailedPrecondition,
    /// 401 Unauthorized.
    Unauthenticated,
    /// 409 Conflict.
    AlreadyExists,
    /// Any other 4xx.
    InvalidArgument,
    /// 504 Gateway Timeout.
    DeadlineExceeded,
    /// 501 Not Implemented.
    Unimplemented,
    /// 503 Service Unavailable.
    Unavailable,
    /// Any other 5xx.
    InternalError,
    /// Anything outside `[0, 600)`.
    Unknown,
}

impl SpanStatus {
    /// Classify an HTTP status code.
    ///
    /// Total over all integers: codes outside `[0, 600)` classify as
    /// [`SpanStatus::Unknown`] rather than being rejected, and no attempt is
    /// made to validate that the code is a registered HTTP status.
    pub fn from_http_code(code: i32) -> Self {
        if !(0..600).contains(&code) {
            return SpanStatus::Unknown;
        }
        match code {
            c if c < 400 => SpanStatus::Ok,
            401 => SpanStatus::Unauthenticated,
            403 => SpanStatus::PermissionDenied,
            404 => SpanStatus::NotFound,
            409 => SpanStatus::AlreadyExists,
            413 => SpanStatus::FailedPrecondition,
            429 => SpanStatus::ResourceExhausted,
            c if c < 500 => SpanStatus::InvalidArgument,
            501 => SpanStatus::Unimplemented,
            503 => SpanStatus::Unavailable,
            504 => SpanStatus::DeadlineExceeded,
            _ => SpanStatus::InternalError,
        }
    }

    /// The stable label for this status, e.g. `"not_found"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "ok",
            SpanStatus::PermissionDenied => "permission_denied",
            SpanStatus::NotFound => "not_found",
            SpanStatus::ResourceExhausted => "resource_exhausted",
            SpanStatus::FailedPrecondition => "failed_precondition",
            SpanStatus::Unauthenticated => "unauthenticated",
            SpanStatus::AlreadyExists => "already_exists",
            SpanStatus::InvalidArgument => "invalid_argument",
            SpanStatus::DeadlineExceeded => "deadline_exceeded",
            SpanStatus::Unimplemented => "unimplemented",
            SpanStatus::Unavailable => "unavailable",
            SpanStatus::InternalError => "internal_error",
            SpanStatus::Unknown => "unknown",
        }
    }
}

impl From<http::StatusCode> for SpanStatus {
    fn from(status: http::StatusCode) -> Self {
        SpanStatus::from_http_code(status.as_u16().into())
    }
}

/// Conversion into the OpenTelemetry span status. Non-OK outcomes become
/// [`Status::Error`] carrying the classification label as description, so the
/// full taxonomy survives export.
impl From<SpanStatus> for Status {
    fn from(status: SpanStatus) -> Self {
        match status {
            SpanStatus::Ok => Status::Ok,
            other => Status::error(other.as_str()),
        }
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_classify_ok() {
        for code in 0..400 {
            assert_eq!(
                SpanStatus::from_http_code(code),
                SpanStatus::Ok,
                "code {code}"
            );
        }
    }

    #[test]
    fn client_error_codes() {
        let exact = [
            (401, SpanStatus::Unauthenticated),
            (403, SpanStatus::PermissionDenied),
            (404, SpanStatus::NotFound),
            (409, SpanStatus::AlreadyExists),
            (413, SpanStatus::FailedPrecondition),
            (429, SpanStatus::ResourceExhausted),
        ];
        for (code, expected) in exact {
            assert_eq!(SpanStatus::from_http_code(code), expected, "code {code}");
        }
        for code in 400..500 {
            if exact.iter().any(|(c, _)| *c == code) {
                continue;
            }
            assert_eq!(
                SpanStatus::from_http_code(code),
                SpanStatus::InvalidArgument,
                "code {code}"
            );
        }
    }

    #[test]
    fn server_error_codes() {
        let exact = [
            (501, SpanStatus::Unimplemented),
            (503, SpanStatus::Unavailable),
            (504, SpanStatus::DeadlineExceeded),
        ];
        for (code, expected) in exact {
            assert_eq!(SpanStatus::from_http_code(code), expected, "code {code}");
        }
        for code in 500..600 {
            if exact.iter().any(|(c, _)| *c == code) {
                continue;
            }
            assert_eq!(
                SpanStatus::from_http_code(code),
                SpanStatus::InternalError,
                "code {code}"
            );
        }
    }

    #[test]
    fn out_of_range_codes_classify_unknown() {
        for code in [i32::MIN, -600, -1, 600, 601, 999, i32::MAX] {
            assert_eq!(
                SpanStatus::from_http_code(code),
                SpanStatus::Unknown,
                "code {code}"
            );
        }
    }

    #[test]
    fn classification_from_status_code_type() {
        assert_eq!(
            SpanStatus::from(http::StatusCode::NOT_FOUND),
            SpanStatus::NotFound
        );
        assert_eq!(SpanStatus::from(http::StatusCode::OK), SpanStatus::Ok);
    }

    #[test]
    fn otel_status_keeps_classification_label() {
        assert_eq!(Status::from(SpanStatus::Ok), Status::Ok);
        assert_eq!(
            Status::from(SpanStatus::NotFound),
            Status::error("not_found")
        );
        assert_eq!(
            Status::from(SpanStatus::Unknown),
            Status::error("unknown")
        );
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(SpanStatus::DeadlineExceeded.as_str(), "deadline_exceeded");
        assert_eq!(SpanStatus::DeadlineExceeded.to_string(), "deadline_exceeded");
    }
}
