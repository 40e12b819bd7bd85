//! Request-scoped cancellation signal.
//!
//! A [`CancellationSignal`] is created once at the external boundary of a
//! request and handed by reference to everything that works on its behalf.
//! It fires when the caller cancels (explicitly, by disconnecting, or by
//! abandoning the call) or when its optional deadline passes. Firing is
//! observed, never pushed: holders either check [`CancellationSignal::cause`]
//! or await [`CancellationSignal::fired`] inside a `select!`.
//!
//! Across the gRPC boundary the signal travels in two parts:
//!
//! - the deadline, encoded in the standard `grpc-timeout` header by
//!   [`CancellationSignal::propagate`] and recovered by
//!   [`CancellationSignal::from_metadata`];
//! - the fired state, carried by the transport itself. Dropping the outbound
//!   call resets the HTTP/2 stream, and the server drops the handler future,
//!   which fires the guard returned by [`CancellationSignal::bind`].

use core::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::metadata::MetadataMap;

/// Header carrying the remaining time budget of a gRPC call.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Largest budget `grpc-timeout` can encode: eight digits of hours.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(99_999_999 * 60 * 60);

/// Why a [`CancellationSignal`] fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelCause {
    /// The caller cancelled or the connection carrying the call was lost.
    Cancelled,
    /// The deadline attached to the signal elapsed.
    DeadlineExceeded,
}

/// A propagating "caller no longer wants this result" token with an optional
/// deadline.
#[derive(Clone, Debug, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancellationSignal {
    /// A signal without a deadline that only fires on [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Budgets above [`MAX_TIMEOUT`] are clamped to it.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout.min(MAX_TIMEOUT))
    }

    /// Recovers the deadline propagated in `grpc-timeout`, if any.
    ///
    /// The returned signal has a fresh token: on the receiving side the fired
    /// state is driven by the transport through [`bind`](Self::bind).
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let deadline = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);

        Self {
            token: CancellationToken::new(),
            deadline,
        }
    }

    /// Derives a signal that fires whenever `self` fires, and which can also
    /// be cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The reason the signal has fired, or `None` while it is still live.
    ///
    /// An explicit cancellation takes precedence over an elapsed deadline.
    pub fn cause(&self) -> Option<CancelCause> {
        if self.token.is_cancelled() {
            return Some(CancelCause::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.cause().is_some()
    }

    /// Resolves when the signal fires. Cancel safe.
    pub async fn fired(&self) -> CancelCause {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => CancelCause::Cancelled,
                    () = tokio::time::sleep_until(deadline) => CancelCause::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelCause::Cancelled
            }
        }
    }

    /// Ties the signal to the lifetime of the current scope.
    ///
    /// The returned guard fires the signal when dropped. Handlers hold it for
    /// the duration of the transport-level call so that an abandoned call
    /// (the framework drops the handler future) becomes a cancellation. Call
    /// [`DropGuard::disarm`] once the call completed normally.
    pub fn bind(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Attaches the remaining budget to an outbound gRPC request.
    pub fn propagate<T>(&self, request: &mut tonic::Request<T>) {
        if let Some(remaining) = self.remaining() {
            // tonic panics on budgets the header cannot encode.
            request.set_timeout(remaining.min(MAX_TIMEOUT));
        }
    }
}

/// Parses a `grpc-timeout` value: at most 8 ASCII digits followed by one of
/// the units `H`, `M`, `S`, `m`, `u` or `n`.
pub fn parse_grpc_timeout(raw: &str) -> Option<Duration> {
    let (digits, unit) = raw.split_at_checked(raw.len().checked_sub(1)?)?;
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(value * 60 * 60),
        "M" => Duration::from_secs(value * 60),
        "S" => Duration::from_secs(value),
        "m" => Duration::from_millis(value),
        "u" => Duration::from_micros(value),
        "n" => Duration::from_nanos(value),
        _ => return None,
    };
    Some(timeout)
}
