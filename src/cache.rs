//! Connections opened for following referrals, kept for reuse.
use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
	config::{ConnectionParameters, EncryptionMethod},
	error::Error,
	monitor::ProgressMonitor,
	referral::ReferralUrl,
	session::{Collaborators, ConnectionSession, SharedSession},
	transport::Connector,
};

/// Provides a session to follow a referral with.
#[async_trait]
pub trait ReferralResolver: Send + Sync {
	/// A connected session for the server the URL names, or `None` if the
	/// referral should be skipped.
	async fn resolve(
		&self,
		url: &ReferralUrl,
		monitor: &ProgressMonitor,
	) -> Result<Option<SharedSession>, Error>;
}

/// Identifies one referral server.
type ServerKey = (bool, String, u16);

/// Resolves referrals by opening sessions modelled on a template
/// connection, one per server, reused for later referrals to the same
/// server.
pub struct ReferralConnections {
	/// Parameters the referral sessions copy everything but the server from.
	template: Arc<ConnectionParameters>,
	/// Opens the transports.
	connector: Arc<dyn Connector>,
	/// Collaborators of the referral sessions.
	collaborators: Collaborators,
	/// Sessions by server.
	sessions: RwLock<HashMap<ServerKey, SharedSession>>,
}

impl fmt::Debug for ReferralConnections {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ReferralConnections")
			.field("template", &self.template.display_name())
			.field("connector", &self.connector)
			.finish_non_exhaustive()
	}
}

impl ReferralConnections {
	/// A resolver for referrals received on `template`'s connection.
	///
	/// `collaborators` should not itself refer back to this resolver, or
	/// the sessions would keep it alive forever.
	pub fn new(
		template: impl Into<Arc<ConnectionParameters>>,
		connector: Arc<dyn Connector>,
		collaborators: Collaborators,
	) -> Self {
		Self { template: template.into(), connector, collaborators, sessions: RwLock::default() }
	}

	/// Number of servers with a cached session.
	pub async fn len(&self) -> usize {
		self.sessions.read().await.len()
	}

	/// Whether no session is cached.
	pub async fn is_empty(&self) -> bool {
		self.sessions.read().await.is_empty()
	}

	/// Disconnect and forget every cached session.
	pub async fn close_all(&self) {
		let sessions: Vec<_> =
			self.sessions.write().await.drain().map(|(_, session)| session).collect();
		for session in sessions {
			session.lock().await.disconnect().await;
		}
	}

	/// Parameters for a session to the server of `url`.
	fn params_for(&self, url: &ReferralUrl) -> ConnectionParameters {
		let mut params = ConnectionParameters::clone(&self.template);
		if !url.host.is_empty() {
			params.host.clone_from(&url.host);
			params.port = url.port;
		}
		params.encryption = match (url.secure, self.template.encryption) {
			(true, _) => EncryptionMethod::Ldaps,
			(false, EncryptionMethod::StartTls) => EncryptionMethod::StartTls,
			(false, _) => EncryptionMethod::None,
		};
		params.name = format!("{} (referral)", params.display_name());
		params
	}
}

#[async_trait]
impl ReferralResolver for ReferralConnections {
	async fn resolve(
		&self,
		url: &ReferralUrl,
		monitor: &ProgressMonitor,
	) -> Result<Option<SharedSession>, Error> {
		let params = self.params_for(url);
		let key = (params.encryption == EncryptionMethod::Ldaps, params.host.clone(), params.port);

		let cached = self.sessions.read().await.get(&key).cloned();
		let session = match cached {
			Some(session) => session,
			None => {
				debug!("Opening referral connection to {}:{}", key.1, key.2);
				let connector = self.connector.clone();
				let collaborators = self.collaborators.clone();
				let session = ConnectionSession::new(params, connector, collaborators);
				self.sessions.write().await.entry(key).or_insert(session.into_shared()).clone()
			}
		};

		{
			let mut guard = session.lock().await;
			if !guard.is_connected() {
				guard.connect(monitor).await?;
				guard.bind(monitor).await?;
			}
		}
		Ok(Some(session))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::{ReferralConnections, ReferralResolver};
	use crate::{
		config::{ConnectionParameters, EncryptionMethod},
		error::Error,
		referral::ReferralUrl,
		session::Collaborators,
		transport::{Connector, Transport, TransportTarget},
	};

	#[derive(Debug)]
	struct Unreachable;

	#[async_trait::async_trait]
	impl Connector for Unreachable {
		async fn connect(&self, target: &TransportTarget) -> Result<Arc<dyn Transport>, Error> {
			Err(Error::Connection(format!("{} unreachable", target.url)))
		}
	}

	fn resolver(encryption: EncryptionMethod) -> ReferralConnections {
		let template = ConnectionParameters {
			name: "primary".to_owned(),
			host: "ldap.example.com".to_owned(),
			port: 389,
			encryption,
			bind_principal: Some("cn=admin,dc=example,dc=com".to_owned()),
			..ConnectionParameters::default()
		};
		ReferralConnections::new(template, Arc::new(Unreachable), Collaborators::default())
	}

	#[test]
	fn referral_parameters_take_the_server_from_the_url() -> Result<(), Error> {
		let resolver = resolver(EncryptionMethod::StartTls);

		let url = ReferralUrl::parse("ldap://other.example.com:1389/dc=other")?;
		let params = resolver.params_for(&url);
		assert_eq!(params.host, "other.example.com");
		assert_eq!(params.port, 1389);
		assert_eq!(params.encryption, EncryptionMethod::StartTls);
		assert_eq!(params.bind_principal.as_deref(), Some("cn=admin,dc=example,dc=com"));

		let params = resolver.params_for(&ReferralUrl::parse("ldaps://secure.example.com/")?);
		assert_eq!(params.encryption, EncryptionMethod::Ldaps);
		assert_eq!(params.port, 636);

		let params = resolver.params_for(&ReferralUrl::parse("ldap:///dc=same")?);
		assert_eq!(params.host, "ldap.example.com");
		assert_eq!(params.port, 389);
		Ok(())
	}

	#[tokio::test]
	async fn failed_connections_are_reported() -> Result<(), Error> {
		let resolver = resolver(EncryptionMethod::None);
		let monitor = crate::monitor::ProgressMonitor::new();
		let url = ReferralUrl::parse("ldap://other.example.com/dc=other")?;

		assert!(matches!(resolver.resolve(&url, &monitor).await, Err(Error::Connection(_))));
		assert!(monitor.errors_reported());
		// The session stays cached for a later attempt.
		assert_eq!(resolver.len().await, 1);
		resolver.close_all().await;
		assert!(resolver.is_empty().await);
		Ok(())
	}
}
