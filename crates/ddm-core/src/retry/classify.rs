//! Classify HTTP status and curl errors into retry policy error kinds.

use super::error::SegmentError;
use super::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        401 | 403 => ErrorKind::AuthExpired,
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

/// Classify a segment error (curl, HTTP, or range-mismatch) into an ErrorKind.
/// Storage and partial-transfer errors are treated as transient transport
/// errors (per §7): a storage write failure could still be retried (the
/// caller may free disk space), and a partial transfer is exactly the
/// "payload truncation" case the retry path exists for.
pub fn classify(e: &SegmentError) -> ErrorKind {
    match e {
        SegmentError::Curl(ce) => classify_curl_error(ce),
        SegmentError::Http(code) => classify_http_status(*code),
        SegmentError::InvalidRangeResponse(code) => classify_http_status(*code),
        SegmentError::PartialTransfer { .. } => ErrorKind::Connection,
        SegmentError::Storage(_) => ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_and_503_throttled() {
        assert_eq!(classify_http_status(429), ErrorKind::Throttled);
        assert_eq!(classify_http_status(503), ErrorKind::Throttled);
    }

    #[test]
    fn http_401_403_auth_expired() {
        assert_eq!(classify_http_status(401), ErrorKind::AuthExpired);
        assert_eq!(classify_http_status(403), ErrorKind::AuthExpired);
    }

    #[test]
    fn http_5xx_retryable() {
        assert!(matches!(classify_http_status(500), ErrorKind::Http5xx(500)));
        assert!(matches!(classify_http_status(502), ErrorKind::Http5xx(502)));
    }

    #[test]
    fn http_404_other() {
        assert_eq!(classify_http_status(404), ErrorKind::Other);
    }

    #[test]
    fn storage_error_not_retried() {
        let e = SegmentError::Storage(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(classify(&e), ErrorKind::Other);
    }

    #[test]
    fn partial_transfer_treated_as_connection() {
        let e = SegmentError::PartialTransfer {
            expected: 100,
            received: 50,
        };
        assert_eq!(classify(&e), ErrorKind::Connection);
    }
}
