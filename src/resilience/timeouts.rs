//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap origin dials and response reads with a deadline
//! - Keep timeouts distinct from other failures so callers can answer
//!   504 Gateway Timeout instead of 502 Bad Gateway

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::http::Target;

/// The deadline passed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Run `fut` with a deadline.
pub async fn with_deadline<F: Future>(deadline: Duration, fut: F) -> Result<F::Output, TimedOut> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| TimedOut(deadline))
}

/// Why a dial to an origin failed.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {target} failed: {source}")]
    Refused {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {target} {source}")]
    TimedOut {
        target: String,
        #[source]
        source: TimedOut,
    },
}

/// Open a TCP connection to `target` within `timeout`.
///
/// Name resolution is left to the OS resolver and counts against the
/// same deadline.
pub async fn connect_with_timeout(target: &Target, timeout: Duration) -> Result<TcpStream, DialError> {
    match with_deadline(timeout, TcpStream::connect((target.host.as_str(), target.port))).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Refused {
            target: target.to_string(),
            source,
        }),
        Err(source) => Err(DialError::TimedOut {
            target: target.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let res = with_deadline(Duration::from_secs(1), std::future::pending::<()>()).await;
        assert_eq!(res, Err(TimedOut(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn refused_dial_is_not_a_timeout() {
        // Bind then drop to find a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Target { host: "127.0.0.1".into(), port };
        let err = connect_with_timeout(&target, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DialError::Refused { .. }));
    }
}
