//! Where bind credentials come from.
use std::fmt;

use crate::config::ConnectionParameters;

/// A bind principal and its secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	/// Bind DN or SASL user name.
	pub principal: String,
	/// Password.
	pub secret: String,
}

impl Credentials {
	/// Credentials from a principal and a secret.
	pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
		Self { principal: principal.into(), secret: secret.into() }
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials").field("principal", &self.principal).finish_non_exhaustive()
	}
}

/// Supplies credentials when a session binds, for example by prompting the
/// user. Returning `None` aborts the bind.
pub trait CredentialsProvider: Send + Sync {
	/// Credentials for binding to the given connection.
	fn credentials(&self, params: &ConnectionParameters) -> Option<Credentials>;
}

/// Hands out the principal and password saved in the connection parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCredentials;

impl CredentialsProvider for StaticCredentials {
	fn credentials(&self, params: &ConnectionParameters) -> Option<Credentials> {
		match (&params.bind_principal, &params.bind_password) {
			(Some(principal), Some(secret)) => Some(Credentials::new(principal, secret)),
			_ => None,
		}
	}
}
