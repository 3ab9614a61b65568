//! Config for LDAP connections.
use std::{path::PathBuf, time::Duration};

use rustls::RootCertStore;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::Error, referral::ReferralHandling};

/// Parameters of one configured directory connection. Read-only to the
/// session that uses them.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionParameters {
	/// Stable identifier of the connection.
	pub id: String,
	/// Human readable name, used in messages.
	pub name: String,
	/// Host name or address of the directory server.
	pub host: String,
	/// Port of the directory server.
	pub port: u16,
	/// How the channel is secured.
	pub encryption: EncryptionMethod,
	/// How the session authenticates after connecting.
	pub auth: AuthMethod,
	/// Saved bind principal, handed out by [`StaticCredentials`].
	///
	/// [`StaticCredentials`]: crate::credentials::StaticCredentials
	pub bind_principal: Option<String>,
	/// Saved bind password, handed out by [`StaticCredentials`].
	///
	/// [`StaticCredentials`]: crate::credentials::StaticCredentials
	pub bind_password: Option<String>,
	/// SASL options, used by the SASL authentication methods.
	pub sasl: SaslConfig,
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,
	/// Reject all write operations on this connection.
	pub read_only: bool,
	/// How referrals answered to write operations are handled.
	pub referral_handling: ReferralHandling,
	/// TLS config
	pub tls: TlsConfig,
}

impl Default for ConnectionParameters {
	fn default() -> Self {
		Self {
			id: String::new(),
			name: String::new(),
			host: "localhost".to_owned(),
			port: 389,
			encryption: EncryptionMethod::None,
			auth: AuthMethod::None,
			bind_principal: None,
			bind_password: None,
			sasl: SaslConfig::default(),
			timeout: 30,
			read_only: false,
			referral_handling: ReferralHandling::Follow,
			tls: TlsConfig::default(),
		}
	}
}

impl ConnectionParameters {
	/// The URL of the server, `ldaps://` for SSL and `ldap://` otherwise.
	pub fn url(&self) -> Result<Url, Error> {
		let scheme = match self.encryption {
			EncryptionMethod::Ldaps => "ldaps",
			EncryptionMethod::None | EncryptionMethod::StartTls => "ldap",
		};
		let host = if self.host.contains(':') && !self.host.starts_with('[') {
			format!("[{}]", self.host)
		} else {
			self.host.clone()
		};
		let url = format!("{scheme}://{host}:{}", self.port);
		Url::parse(&url).map_err(|_| Error::InvalidUrl(url))
	}

	/// Timeout for opening the transport.
	#[must_use]
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout)
	}

	/// Name to show in messages, falling back to `host:port`.
	#[must_use]
	pub fn display_name(&self) -> String {
		if self.name.is_empty() {
			format!("{}:{}", self.host, self.port)
		} else {
			self.name.clone()
		}
	}
}

/// How the connection to the server is secured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMethod {
	/// Plain text.
	#[default]
	None,
	/// TLS on a dedicated port (`ldaps://`).
	Ldaps,
	/// Plain connection upgraded with the StartTLS extended operation.
	StartTls,
}

/// How the session authenticates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
	/// Anonymous.
	#[default]
	None,
	/// Simple bind with DN and password.
	Simple,
	/// SASL DIGEST-MD5.
	SaslDigestMd5,
	/// SASL CRAM-MD5.
	SaslCramMd5,
	/// SASL GSSAPI (Kerberos).
	SaslGssapi,
}

impl AuthMethod {
	/// The mechanism name as it goes on the wire.
	#[must_use]
	pub fn mechanism(self) -> &'static str {
		match self {
			AuthMethod::None => "none",
			AuthMethod::Simple => "simple",
			AuthMethod::SaslDigestMd5 => "DIGEST-MD5",
			AuthMethod::SaslCramMd5 => "CRAM-MD5",
			AuthMethod::SaslGssapi => "GSSAPI",
		}
	}

	/// Whether this is one of the SASL mechanisms.
	#[must_use]
	pub fn is_sasl(self) -> bool {
		matches!(self, AuthMethod::SaslDigestMd5 | AuthMethod::SaslCramMd5 | AuthMethod::SaslGssapi)
	}
}

/// SASL options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaslConfig {
	/// Realm for DIGEST-MD5.
	pub realm: Option<String>,
	/// Requested quality of protection.
	pub qop: SaslQop,
	/// Requested cryptographic strength.
	pub strength: SaslStrength,
	/// Require the server to authenticate itself too.
	pub mutual_authentication: bool,
}

impl Default for SaslConfig {
	fn default() -> Self {
		Self {
			realm: None,
			qop: SaslQop::Auth,
			strength: SaslStrength::High,
			mutual_authentication: true,
		}
	}
}

/// SASL quality of protection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslQop {
	/// Authentication only.
	Auth,
	/// Authentication with integrity protection.
	AuthInt,
	/// Authentication with integrity and confidentiality protection.
	AuthConf,
}

impl SaslQop {
	/// Token used in SASL negotiation.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			SaslQop::Auth => "auth",
			SaslQop::AuthInt => "auth-int",
			SaslQop::AuthConf => "auth-conf",
		}
	}
}

/// SASL cipher strength
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslStrength {
	/// Low
	Low,
	/// Medium
	Medium,
	/// High
	High,
}

/// TLS Configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
	/// Verify server certificates, asking the trust callback about
	/// certificates that fail verification. When disabled every certificate
	/// is accepted.
	pub validate_certificates: bool,
	/// PEM bundle of root certificates. The platform store is used if unset.
	pub root_certificates_path: Option<PathBuf>,
}

impl Default for TlsConfig {
	fn default() -> Self {
		Self { validate_certificates: true, root_certificates_path: None }
	}
}

impl TlsConfig {
	/// Load the root certificates that server chains are verified against.
	pub(crate) async fn root_store(&self) -> Result<RootCertStore, Error> {
		let mut store = RootCertStore::empty();
		let der_certs = if let Some(path) = &self.root_certificates_path {
			let pem = tokio::fs::read(path).await?;
			let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
			if certs.is_empty() {
				return Err(Error::Invalid(format!(
					"No certificates found in {}",
					path.display()
				)));
			}
			certs
		} else {
			rustls_native_certs::load_native_certs()?.into_iter().map(|cert| cert.0).collect()
		};
		let (added, ignored) = store.add_parsable_certificates(&der_certs);
		if ignored > 0 {
			tracing::warn!("Ignored {ignored} unparsable root certificates");
		}
		if added == 0 && self.root_certificates_path.is_some() {
			return Err(Error::Invalid("Could not read root certificate".to_owned()));
		}
		Ok(store)
	}
}
