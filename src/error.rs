//! Error codes

/// LDAP result code signalling a referral.
pub const RC_REFERRAL: u32 = 10;
/// LDAP result code for an exceeded administrative limit.
pub const RC_ADMIN_LIMIT_EXCEEDED: u32 = 11;
/// LDAP result code for rejected credentials.
pub const RC_INVALID_CREDENTIALS: u32 = 49;
/// LDAP result code for a busy server.
pub const RC_BUSY: u32 = 51;
/// LDAP result code for an unavailable server.
pub const RC_UNAVAILABLE: u32 = 52;

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The transport could not be opened, or broke down while in use.
	#[error("Connection failed: {0}")]
	Connection(String),
	/// TLS could not be established, usually because the server certificate
	/// was rejected.
	#[error("TLS negotiation failed: {0}")]
	Tls(String),
	/// An operation needed a live connection but the session has none.
	#[error("No connection")]
	NotConnected,
	/// No credentials provider is configured or it returned no credentials.
	#[error("No credentials available for binding")]
	AuthenticationUnavailable,
	/// The server rejected the bind.
	#[error("Authentication failed: {0}")]
	Authentication(String),
	/// The transport cannot perform the requested SASL mechanism.
	#[error("Unsupported authentication mechanism {0}")]
	UnsupportedMechanism(&'static str),
	/// The directory server answered with a non-success result code.
	#[error("LDAP error {code}: {message}")]
	Protocol {
		/// The LDAP result code as sent by the server.
		code: u32,
		/// Diagnostic message sent by the server.
		message: String,
		/// Matched DN sent by the server, if any.
		matched: String,
	},
	/// The server redirected the operation to the given LDAP URLs.
	#[error("Referral to {}", .0.join(", "))]
	Referral(Vec<String>),
	/// A referral pointed at a URL that was already queued or visited.
	#[error("Referral loop detected at {0}")]
	LoopDetected(String),
	/// A referral or connection URL could not be parsed.
	#[error("Invalid LDAP URL {0}")]
	InvalidUrl(String),
	/// The operation was cancelled through its progress monitor.
	#[error("Operation cancelled")]
	Cancelled,
	/// A write was attempted on a read-only connection.
	#[error("Connection {0} is read-only")]
	ReadOnly(String),
	/// The contents of the configuration were invalid.
	#[error("Invalid configuration: {0}")]
	Invalid(String),
	/// Failed to read a file referenced by the configuration.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// An underlying protocol error or similar occurred, or the LDAP library
	/// was used incorrectly.
	#[error(transparent)]
	Ldap(#[from] ldap3::LdapError),
}

impl Error {
	/// Builds the error for an unsuccessful LDAP result.
	pub(crate) fn from_result(result: &ldap3::LdapResult) -> Self {
		match result.rc {
			RC_REFERRAL => Error::Referral(result.refs.clone()),
			RC_INVALID_CREDENTIALS => Error::Authentication(result.text.clone()),
			code => Error::Protocol {
				code,
				message: result.text.clone(),
				matched: result.matched.clone(),
			},
		}
	}

	/// Whether a failure is transport-level and worth one reconnect and
	/// retry. Semantic errors from the server are never transient.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		match self {
			Error::Connection(_) | Error::NotConnected => true,
			Error::Io(err) => is_transient_io(err),
			Error::Protocol { code, .. } => {
				matches!(*code, RC_BUSY | RC_UNAVAILABLE | RC_ADMIN_LIMIT_EXCEEDED)
			}
			Error::Ldap(err) => match err {
				ldap3::LdapError::Io { source } => is_transient_io(source),
				ldap3::LdapError::OpSend { .. }
				| ldap3::LdapError::ResultRecv { .. }
				| ldap3::LdapError::EndOfStream => true,
				ldap3::LdapError::LdapResult { result } => {
					matches!(result.rc, RC_BUSY | RC_UNAVAILABLE | RC_ADMIN_LIMIT_EXCEEDED)
				}
				_ => false,
			},
			_ => false,
		}
	}

	/// The server result code, for errors that carry one.
	#[must_use]
	pub fn result_code(&self) -> Option<u32> {
		match self {
			Error::Protocol { code, .. } => Some(*code),
			Error::Referral(_) => Some(RC_REFERRAL),
			Error::Ldap(ldap3::LdapError::LdapResult { result }) => Some(result.rc),
			_ => None,
		}
	}
}

/// I/O failures that mean the channel is gone rather than the request bad.
fn is_transient_io(err: &std::io::Error) -> bool {
	use std::io::ErrorKind;
	matches!(
		err.kind(),
		ErrorKind::ConnectionReset
			| ErrorKind::ConnectionAborted
			| ErrorKind::ConnectionRefused
			| ErrorKind::NotConnected
			| ErrorKind::BrokenPipe
			| ErrorKind::UnexpectedEof
			| ErrorKind::TimedOut
			| ErrorKind::OutOfMemory
	)
}
