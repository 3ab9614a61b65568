//! Server certificate verification with a human in the loop.
//!
//! [`TrustDecisionInterceptor`] plugs into the rustls handshake. Chains that
//! were accepted manually before pass straight away. Otherwise every check
//! runs and all failures go to the [`TrustCallback`] in a single call, which
//! decides whether to trust the certificate permanently, for this session,
//! or not at all.
use std::{
	collections::HashSet,
	fmt,
	net::IpAddr,
	sync::{Arc, PoisonError, RwLock},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use rustls::{
	client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier},
	Certificate, CertificateError, RootCertStore, ServerName,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use x509_parser::{certificate::X509Certificate, extensions::GeneralName, prelude::FromDer};

/// Why a server certificate failed verification.
#[derive(Debug, Clone)]
pub enum TrustFailureCause {
	/// The chain does not lead to a trusted root.
	ChainUntrusted(CertificateError),
	/// The certificate is expired or not yet valid.
	ValidityPeriod(CertificateError),
	/// The certificate was not issued for the host connected to.
	HostnameMismatch(CertificateError),
}

impl TrustFailureCause {
	/// The underlying verification error.
	#[must_use]
	pub fn error(&self) -> &CertificateError {
		match self {
			TrustFailureCause::ChainUntrusted(err)
			| TrustFailureCause::ValidityPeriod(err)
			| TrustFailureCause::HostnameMismatch(err) => err,
		}
	}
}

/// Verdict of the trust callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
	/// Trust the certificate from now on.
	Permanent,
	/// Trust the certificate until the application exits.
	Session,
	/// Abort the handshake.
	Reject,
}

/// Asked whenever a certificate fails verification.
pub trait TrustCallback: Send + Sync {
	/// Decide about the chain presented by `host`, given every reason it
	/// failed verification.
	fn verify(
		&self,
		host: &str,
		chain: &[Certificate],
		causes: &[TrustFailureCause],
	) -> TrustDecision;
}

/// Certificates accepted manually. Shared by all sessions; additions are
/// visible to concurrent readers only once complete.
#[derive(Debug, Default)]
pub struct TrustStore {
	/// Accepted end-entity certificates.
	certificates: RwLock<HashSet<Certificate>>,
}

/// Serializable contents of a [`TrustStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStoreSnapshot {
	/// DER encoded certificates
	pub certificates: Vec<Vec<u8>>,
}

impl TrustStore {
	/// An empty store.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Restore a store from a snapshot.
	#[must_use]
	pub fn from_snapshot(snapshot: TrustStoreSnapshot) -> Self {
		let certificates = snapshot.certificates.into_iter().map(Certificate).collect();
		Self { certificates: RwLock::new(certificates) }
	}

	/// Whether the certificate was accepted before.
	#[must_use]
	pub fn contains(&self, certificate: &Certificate) -> bool {
		self.certificates.read().unwrap_or_else(PoisonError::into_inner).contains(certificate)
	}

	/// Accept a certificate.
	pub fn add(&self, certificate: Certificate) {
		self.certificates.write().unwrap_or_else(PoisonError::into_inner).insert(certificate);
	}

	/// Number of accepted certificates.
	#[must_use]
	pub fn len(&self) -> usize {
		self.certificates.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	/// Whether nothing was accepted yet.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Copy the contents for persisting.
	#[must_use]
	pub fn snapshot(&self) -> TrustStoreSnapshot {
		let certificates = self.certificates.read().unwrap_or_else(PoisonError::into_inner);
		let certificates = certificates.iter().map(|cert| cert.0.clone()).collect();
		TrustStoreSnapshot { certificates }
	}
}

/// The permanent and the session trust store, shared by every session of
/// the application.
#[derive(Debug, Clone, Default)]
pub struct TrustStores {
	/// Certificates trusted across restarts.
	pub permanent: Arc<TrustStore>,
	/// Certificates trusted until the application exits.
	pub session: Arc<TrustStore>,
}

impl TrustStores {
	/// Whether either store accepted the certificate before.
	#[must_use]
	pub fn accepts(&self, certificate: &Certificate) -> bool {
		self.permanent.contains(certificate) || self.session.contains(certificate)
	}
}

/// The independent checks a certificate chain has to pass.
pub trait CertificateChecks: Send + Sync {
	/// The chain leads to a trusted root, ignoring validity period and
	/// host name.
	fn chain_trust(
		&self,
		chain: &[Certificate],
		host: &str,
		now: SystemTime,
	) -> Result<(), CertificateError>;

	/// The end-entity certificate is valid at `now`.
	fn validity(&self, end_entity: &Certificate, now: SystemTime) -> Result<(), CertificateError>;

	/// The end-entity certificate names `host`.
	fn hostname(&self, end_entity: &Certificate, host: &str) -> Result<(), CertificateError>;
}

/// Checks against a root store with webpki, and certificate fields with
/// x509-parser.
pub struct WebPkiChecks {
	/// Verifier for the chain against the roots.
	verifier: WebPkiVerifier,
}

impl fmt::Debug for WebPkiChecks {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WebPkiChecks").finish_non_exhaustive()
	}
}

impl WebPkiChecks {
	/// Checks against the given roots.
	#[must_use]
	pub fn new(roots: RootCertStore) -> Self {
		Self { verifier: WebPkiVerifier::new(roots, None) }
	}
}

/// Parse a DER certificate.
fn parse(certificate: &Certificate) -> Result<X509Certificate<'_>, CertificateError> {
	X509Certificate::from_der(&certificate.0)
		.map(|(_, cert)| cert)
		.map_err(|_| CertificateError::BadEncoding)
}

/// Seconds since the epoch, negative before it.
fn unix_seconds(at: SystemTime) -> i64 {
	OffsetDateTime::from(at).unix_timestamp()
}

impl CertificateChecks for WebPkiChecks {
	fn chain_trust(
		&self,
		chain: &[Certificate],
		host: &str,
		now: SystemTime,
	) -> Result<(), CertificateError> {
		let (end_entity, intermediates) = chain.split_first().ok_or(CertificateError::BadEncoding)?;

		// Path building also checks validity, so verify at a time the
		// certificate is valid; the validity check reports it separately.
		let cert = parse(end_entity)?;
		let not_before = cert.validity().not_before.timestamp();
		let not_after = cert.validity().not_after.timestamp();
		let current = unix_seconds(now);
		let at = if (not_before..=not_after).contains(&current) {
			now
		} else {
			let midpoint = not_before + (not_after - not_before) / 2;
			UNIX_EPOCH + Duration::from_secs(u64::try_from(midpoint).unwrap_or_default())
		};

		let name = ServerName::try_from(host)
			.or_else(|_| ServerName::try_from("localhost"))
			.map_err(|err| CertificateError::Other(Arc::new(err)))?;
		match self.verifier.verify_server_cert(
			end_entity,
			intermediates,
			&name,
			&mut std::iter::empty(),
			&[],
			at,
		) {
			Ok(_) | Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
				Ok(())
			}
			Err(rustls::Error::InvalidCertificate(err)) => Err(err),
			Err(err) => Err(CertificateError::Other(Arc::new(err))),
		}
	}

	fn validity(&self, end_entity: &Certificate, now: SystemTime) -> Result<(), CertificateError> {
		let cert = parse(end_entity)?;
		let current = unix_seconds(now);
		if current < cert.validity().not_before.timestamp() {
			Err(CertificateError::NotValidYet)
		} else if current > cert.validity().not_after.timestamp() {
			Err(CertificateError::Expired)
		} else {
			Ok(())
		}
	}

	fn hostname(&self, end_entity: &Certificate, host: &str) -> Result<(), CertificateError> {
		let cert = parse(end_entity)?;
		let ip = host.trim_matches(&['[', ']'][..]).parse::<IpAddr>().ok();

		let mut dns_names = Vec::new();
		if let Ok(Some(san)) = cert.subject_alternative_name() {
			for name in &san.value.general_names {
				match (name, ip) {
					(GeneralName::DNSName(dns), _) => dns_names.push(*dns),
					(GeneralName::IPAddress(bytes), Some(ip)) if ip_matches(bytes, ip) => {
						return Ok(());
					}
					_ => {}
				}
			}
		}
		if ip.is_none() {
			if dns_names.is_empty() {
				dns_names.extend(
					cert.subject().iter_common_name().filter_map(|cn| cn.as_str().ok()),
				);
			}
			if dns_names.iter().any(|pattern| host_matches(pattern, host)) {
				return Ok(());
			}
		}
		Err(CertificateError::NotValidForName)
	}
}

/// Compare an IP SAN with an address.
fn ip_matches(bytes: &[u8], ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => bytes == v4.octets(),
		IpAddr::V6(v6) => bytes == v6.octets(),
	}
}

/// Match a host against a certificate name, where a leading `*` label
/// stands for exactly one label.
pub(crate) fn host_matches(pattern: &str, host: &str) -> bool {
	let pattern = pattern.trim_end_matches('.');
	let host = host.trim_end_matches('.');
	match pattern.strip_prefix("*.") {
		Some(suffix) => host
			.split_once('.')
			.is_some_and(|(label, rest)| !label.is_empty() && rest.eq_ignore_ascii_case(suffix)),
		None => pattern.eq_ignore_ascii_case(host),
	}
}

/// Verifies server certificates during TLS negotiation, asking the trust
/// callback about certificates that fail any check.
pub struct TrustDecisionInterceptor {
	/// Host the session connects to.
	host: String,
	/// Certificate checks.
	checks: Arc<dyn CertificateChecks>,
	/// Manually accepted certificates.
	stores: TrustStores,
	/// Decides about failing certificates. Without one they are rejected.
	callback: Option<Arc<dyn TrustCallback>>,
}

impl fmt::Debug for TrustDecisionInterceptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TrustDecisionInterceptor")
			.field("host", &self.host)
			.field("has_callback", &self.callback.is_some())
			.finish_non_exhaustive()
	}
}

impl TrustDecisionInterceptor {
	/// An interceptor verifying certificates presented by `host`.
	pub fn new(
		host: impl Into<String>,
		checks: Arc<dyn CertificateChecks>,
		stores: TrustStores,
		callback: Option<Arc<dyn TrustCallback>>,
	) -> Self {
		Self { host: host.into(), checks, stores, callback }
	}

	/// Host certificates are verified for.
	#[must_use]
	pub fn host(&self) -> &str {
		&self.host
	}

	/// Every reason the chain fails verification.
	#[must_use]
	pub fn failure_causes(&self, chain: &[Certificate], now: SystemTime) -> Vec<TrustFailureCause> {
		let Some(end_entity) = chain.first() else {
			return vec![TrustFailureCause::ChainUntrusted(CertificateError::BadEncoding)];
		};
		let mut causes = Vec::new();
		if let Err(err) = self.checks.chain_trust(chain, &self.host, now) {
			causes.push(TrustFailureCause::ChainUntrusted(err));
		}
		if let Err(err) = self.checks.validity(end_entity, now) {
			causes.push(TrustFailureCause::ValidityPeriod(err));
		}
		if let Err(err) = self.checks.hostname(end_entity, &self.host) {
			causes.push(TrustFailureCause::HostnameMismatch(err));
		}
		causes
	}

	/// Verify a chain, end-entity certificate first.
	pub fn verify_chain(
		&self,
		chain: &[Certificate],
		now: SystemTime,
	) -> Result<(), rustls::Error> {
		let Some(end_entity) = chain.first() else {
			return Err(rustls::Error::InvalidCertificate(CertificateError::BadEncoding));
		};
		if self.stores.accepts(end_entity) {
			debug!("Certificate of {} was accepted before", self.host);
			return Ok(());
		}

		let causes = self.failure_causes(chain, now);
		let Some(first) = causes.first() else {
			return Ok(());
		};

		let decision = match &self.callback {
			Some(callback) => callback.verify(&self.host, chain, &causes),
			None => TrustDecision::Reject,
		};
		match decision {
			TrustDecision::Permanent => {
				info!("Trusting certificate of {} permanently", self.host);
				self.stores.permanent.add(end_entity.clone());
				Ok(())
			}
			TrustDecision::Session => {
				info!("Trusting certificate of {} for this session", self.host);
				self.stores.session.add(end_entity.clone());
				Ok(())
			}
			TrustDecision::Reject => {
				warn!("Rejected certificate of {}: {:?}", self.host, causes);
				Err(rustls::Error::InvalidCertificate(first.error().clone()))
			}
		}
	}
}

impl ServerCertVerifier for TrustDecisionInterceptor {
	fn verify_server_cert(
		&self,
		end_entity: &Certificate,
		intermediates: &[Certificate],
		_server_name: &ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		now: SystemTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		let mut chain = Vec::with_capacity(intermediates.len() + 1);
		chain.push(end_entity.clone());
		chain.extend_from_slice(intermediates);
		self.verify_chain(&chain, now).map(|()| ServerCertVerified::assertion())
	}
}
