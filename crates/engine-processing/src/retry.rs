use connectors::error::SinkError;
use engine_core::retry::RetryDisposition;

pub fn classify_sink_error(err: &SinkError) -> RetryDisposition {
    match err {
        SinkError::Transport(_) | SinkError::Timeout(_) => RetryDisposition::Retry,
        SinkError::Server { code, status, .. } => {
            if code.is_some_and(is_retryable_server_code) || is_retryable_status(*status) {
                RetryDisposition::Retry
            } else {
                RetryDisposition::Stop
            }
        }
        SinkError::Encode(_) | SinkError::Decode(_) => RetryDisposition::Stop,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 502 | 503 | 504)
}

fn is_retryable_server_code(code: u32) -> bool {
    // Server error codes that are typically transient.
    // See: https://github.com/ClickHouse/ClickHouse/blob/master/src/Common/ErrorCodes.cpp
    const RETRYABLE_CODES: [u32; 14] = [
        3,   // UNEXPECTED_END_OF_FILE
        159, // TIMEOUT_EXCEEDED
        164, // READONLY
        202, // TOO_MANY_SIMULTANEOUS_QUERIES
        209, // SOCKET_TIMEOUT
        210, // NETWORK_ERROR
        236, // ABORTED
        241, // MEMORY_LIMIT_EXCEEDED
        242, // TABLE_IS_READ_ONLY
        252, // TOO_MANY_PARTS
        285, // TOO_FEW_LIVE_REPLICAS
        319, // UNKNOWN_STATUS_OF_INSERT
        425, // SYSTEM_ERROR
        999, // KEEPER_EXCEPTION
    ];
    RETRYABLE_CODES.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(code: Option<u32>, status: u16) -> SinkError {
        SinkError::Server {
            code,
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn transport_failures_are_retried() {
        assert_eq!(
            classify_sink_error(&SinkError::Transport("reset".into())),
            RetryDisposition::Retry
        );
        assert_eq!(
            classify_sink_error(&SinkError::Timeout("30s".into())),
            RetryDisposition::Retry
        );
    }

    #[test]
    fn server_errors_are_classified_by_code_then_status() {
        assert_eq!(classify_sink_error(&server(Some(252), 500)), RetryDisposition::Retry);
        // UNKNOWN_TABLE
        assert_eq!(classify_sink_error(&server(Some(60), 404)), RetryDisposition::Stop);
        assert_eq!(classify_sink_error(&server(None, 503)), RetryDisposition::Retry);
        assert_eq!(classify_sink_error(&server(None, 400)), RetryDisposition::Stop);
    }

    #[test]
    fn encoding_problems_are_fatal() {
        assert_eq!(
            classify_sink_error(&SinkError::Encode("nan".into())),
            RetryDisposition::Stop
        );
    }
}
