// Status-code classification for publish retries, stream reconnects and ack outcomes.
use kestrel_wire::{Code, Status};

use crate::error::AckResponse;

const SHUTDOWN_NOW_MESSAGE: &str = "Server shutdownNow invoked";

/// Codes a publish RPC is retried on.
pub(crate) fn is_publish_retryable(code: Code) -> bool {
    matches!(
        code,
        Code::Aborted
            | Code::Cancelled
            | Code::DeadlineExceeded
            | Code::Internal
            | Code::ResourceExhausted
            | Code::Unknown
            | Code::Unavailable
    )
}

/// Whether a streaming-pull or ack RPC failure should be retried.
pub(crate) fn is_stream_retryable(status: &Status) -> bool {
    match status.code {
        Code::DeadlineExceeded
        | Code::Internal
        | Code::Cancelled
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Unknown => true,
        // A server that is going away for good will not come back on reconnect.
        Code::Unavailable => !status.message.contains(SHUTDOWN_NOW_MESSAGE),
        _ => false,
    }
}

/// Caller-visible response for a permanent ack failure with the given code.
pub(crate) fn ack_response_for(code: Code) -> AckResponse {
    match code {
        Code::FailedPrecondition => AckResponse::FailedPrecondition,
        Code::PermissionDenied => AckResponse::PermissionDenied,
        _ => AckResponse::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_now_is_not_retryable() {
        assert!(is_stream_retryable(&Status::new(Code::Unavailable, "try later")));
        assert!(!is_stream_retryable(&Status::new(
            Code::Unavailable,
            "Server shutdownNow invoked"
        )));
        assert!(!is_stream_retryable(&Status::new(Code::NotFound, "gone")));
    }

    #[test]
    fn publish_retry_codes() {
        assert!(is_publish_retryable(Code::Unavailable));
        assert!(is_publish_retryable(Code::Aborted));
        assert!(!is_publish_retryable(Code::InvalidArgument));
        assert!(!is_publish_retryable(Code::PermissionDenied));
    }

    #[test]
    fn ack_codes_map_to_responses() {
        assert_eq!(
            ack_response_for(Code::FailedPrecondition),
            AckResponse::FailedPrecondition
        );
        assert_eq!(
            ack_response_for(Code::PermissionDenied),
            AckResponse::PermissionDenied
        );
        assert_eq!(ack_response_for(Code::NotFound), AckResponse::Other);
    }
}
