// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use nre_proto::CodecError;
use thiserror::Error;

/// Failures talking to a store.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure or timeout.
    #[error("connection to {url} failed: {reason}")]
    Connection {
        /// Request URL.
        url: String,
        /// Transport message.
        reason: String,
        /// The total request timeout elapsed.
        timeout: bool,
    },
    /// The store rejected the request (4xx).
    #[error("bad request ({status}): {body}")]
    BadRequest {
        /// HTTP status.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },
    /// Any other non-2xx status.
    #[error("store returned status {status}")]
    Remote {
        /// HTTP status.
        status: u16,
    },
    /// An href names a store this process is not connected to.
    #[error("no store for {0}")]
    Reference(String),
    /// Body could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The client is closing and accepts no new requests.
    #[error("client is shut down")]
    Shutdown,
}

impl ClientError {
    /// Transport errors, timeouts, and 5xx may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Remote { status } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn connection(url: &str, err: &reqwest::Error) -> Self {
        Self::Connection {
            url: url.to_string(),
            reason: err.to_string(),
            timeout: err.is_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let conn = ClientError::Connection {
            url: "http://s".into(),
            reason: "reset".into(),
            timeout: true,
        };
        assert!(conn.is_retryable());
        assert!(ClientError::Remote { status: 503 }.is_retryable());
        assert!(!ClientError::Remote { status: 302 }.is_retryable());
        assert!(!ClientError::BadRequest {
            status: 400,
            body: String::new()
        }
        .is_retryable());
    }
}
