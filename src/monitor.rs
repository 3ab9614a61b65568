//! Progress monitor handed in by callers to cancel operations and collect
//! reported errors.
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellation and error reporting for one or more operations.
///
/// Clones share state: cancelling one clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor {
	/// Cancellation signal.
	token: CancellationToken,
	/// Messages of reported errors, oldest first.
	errors: Arc<Mutex<Vec<String>>>,
}

impl ProgressMonitor {
	/// A fresh, uncancelled monitor.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Request cancellation of every operation running under this monitor.
	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// Whether cancellation was requested.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Completes once cancellation is requested. Awaiting this inside a
	/// `select!` registers interest in the cancellation for exactly as long
	/// as the select runs.
	pub async fn cancelled(&self) {
		self.token.cancelled().await;
	}

	/// Record an error for later display. Cancellation is not an error and
	/// is not recorded.
	pub fn report_error(&self, message: &str, cause: &Error) {
		if matches!(cause, Error::Cancelled) {
			tracing::debug!("{message}: cancelled");
			return;
		}
		tracing::warn!("{message}: {cause}");
		self.errors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(format!("{message}: {cause}"));
	}

	/// Messages of all errors reported so far.
	#[must_use]
	pub fn errors(&self) -> Vec<String> {
		self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Whether any error was reported.
	#[must_use]
	pub fn errors_reported(&self) -> bool {
		!self.errors.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
	}
}
