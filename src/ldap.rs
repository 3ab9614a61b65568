//! Transport implementation on top of `ldap3`.
use std::{collections::HashSet, fmt, sync::Arc};

use async_trait::async_trait;
use ldap3::{
	DerefAliases, LdapConnAsync, LdapConnSettings, LdapResult, Mod, Scope, SearchEntry,
	SearchOptions, SearchStream,
};
use rustls::ClientConfig;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
	config::{AuthMethod, EncryptionMethod},
	error::Error,
	transport::{
		split_rdn, AliasDereferencing, Attribute, BindRequest, Connector, EntryStream, Modification,
		SearchRequest, SearchScope, StreamItem, Transport, TransportTarget,
	},
};

/// Opens `ldap3` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LdapConnector;

impl LdapConnector {
	/// Connection settings for the target.
	fn settings(target: &TransportTarget) -> LdapConnSettings {
		let mut settings = LdapConnSettings::new()
			.set_conn_timeout(target.connect_timeout)
			.set_starttls(target.encryption == EncryptionMethod::StartTls);
		if target.encryption != EncryptionMethod::None {
			settings = match &target.verifier {
				Some(verifier) => {
					let config = ClientConfig::builder()
						.with_safe_defaults()
						.with_custom_certificate_verifier(verifier.clone())
						.with_no_client_auth();
					settings.set_config(Arc::new(config))
				}
				None => settings.set_no_tls_verify(true),
			};
		}
		settings
	}
}

#[async_trait]
impl Connector for LdapConnector {
	async fn connect(&self, target: &TransportTarget) -> Result<Arc<dyn Transport>, Error> {
		let settings = Self::settings(target);
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, &target.url)
			.await
			.map_err(|err| connect_error(err, target.encryption))?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});
		Ok(Arc::new(LdapTransport { host: target.host.clone(), ldap, driver }))
	}
}

/// Classify a failure to open a connection.
fn connect_error(err: ldap3::LdapError, encryption: EncryptionMethod) -> Error {
	match err {
		ldap3::LdapError::Io { source }
			if encryption != EncryptionMethod::None
				&& source.kind() == std::io::ErrorKind::InvalidData =>
		{
			Error::Tls(source.to_string())
		}
		err => Error::Connection(err.to_string()),
	}
}

/// An open `ldap3` connection.
struct LdapTransport {
	/// Host the connection was opened to.
	host: String,
	/// Handle for issuing operations.
	ldap: ldap3::Ldap,
	/// Task driving the connection.
	driver: JoinHandle<()>,
}

impl fmt::Debug for LdapTransport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LdapTransport").field("host", &self.host).finish_non_exhaustive()
	}
}

/// Turn a result into an error unless it is a success.
fn check(result: LdapResult) -> Result<(), Error> {
	if result.rc == 0 {
		Ok(())
	} else {
		Err(Error::from_result(&result))
	}
}

/// Values of an attribute as a set.
fn value_set(attribute: &Attribute) -> HashSet<&str> {
	attribute.values.iter().map(String::as_str).collect()
}

#[async_trait]
impl Transport for LdapTransport {
	async fn bind(&self, request: &BindRequest) -> Result<(), Error> {
		let mut ldap = self.ldap.clone();
		match request.method {
			AuthMethod::None => check(ldap.simple_bind("", "").await?),
			AuthMethod::Simple => {
				check(ldap.simple_bind(&request.principal, &request.credentials).await?)
			}
			#[cfg(feature = "gssapi")]
			AuthMethod::SaslGssapi => check(ldap.sasl_gssapi_bind(&self.host).await?),
			method => Err(Error::UnsupportedMechanism(method.mechanism())),
		}
	}

	async fn search(&self, request: &SearchRequest) -> Result<Box<dyn EntryStream>, Error> {
		let scope = match request.scope {
			SearchScope::Base => Scope::Base,
			SearchScope::OneLevel => Scope::OneLevel,
			SearchScope::Subtree => Scope::Subtree,
		};
		let deref = match request.deref {
			AliasDereferencing::Never => DerefAliases::Never,
			AliasDereferencing::Searching => DerefAliases::Searching,
			AliasDereferencing::Finding => DerefAliases::Finding,
			AliasDereferencing::Always => DerefAliases::Always,
		};
		let options = SearchOptions::new()
			.deref(deref)
			.sizelimit(request.size_limit)
			.timelimit(request.time_limit);

		let mut ldap = self.ldap.clone();
		let stream = ldap
			.with_search_options(options)
			.streaming_search(&request.base, scope, &request.filter, request.attributes.clone())
			.await?;
		Ok(Box::new(LdapEntryStream { stream: Some(stream) }))
	}

	async fn add(&self, dn: &str, attributes: &[Attribute]) -> Result<(), Error> {
		let attributes = attributes
			.iter()
			.map(|attribute| (attribute.name.as_str(), value_set(attribute)))
			.collect();
		check(self.ldap.clone().add(dn, attributes).await?)
	}

	async fn modify(&self, dn: &str, changes: &[Modification]) -> Result<(), Error> {
		let changes = changes
			.iter()
			.map(|change| match change {
				Modification::Add(attribute) => {
					Mod::Add(attribute.name.as_str(), value_set(attribute))
				}
				Modification::Delete(attribute) => {
					Mod::Delete(attribute.name.as_str(), value_set(attribute))
				}
				Modification::Replace(attribute) => {
					Mod::Replace(attribute.name.as_str(), value_set(attribute))
				}
				Modification::Increment { name, amount } => {
					Mod::Increment(name.as_str(), amount.as_str())
				}
			})
			.collect();
		check(self.ldap.clone().modify(dn, changes).await?)
	}

	async fn delete(&self, dn: &str) -> Result<(), Error> {
		check(self.ldap.clone().delete(dn).await?)
	}

	async fn rename(&self, old_dn: &str, new_dn: &str, delete_old_rdn: bool) -> Result<(), Error> {
		let (_, old_parent) = split_rdn(old_dn);
		let (rdn, new_parent) = split_rdn(new_dn);
		let new_superior = (!new_parent.eq_ignore_ascii_case(old_parent)).then_some(new_parent);
		check(self.ldap.clone().modifydn(old_dn, rdn, delete_old_rdn, new_superior).await?)
	}

	async fn close(&self) {
		if let Err(err) = self.ldap.clone().unbind().await {
			debug!("Unbind from {} failed: {err}", self.host);
		}
		self.driver.abort();
	}
}

/// Results of one `ldap3` search.
struct LdapEntryStream {
	/// The search, `None` once finished.
	stream: Option<SearchStream<'static, String, Vec<String>>>,
}

impl fmt::Debug for LdapEntryStream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LdapEntryStream").field("finished", &self.stream.is_none()).finish()
	}
}

#[async_trait]
impl EntryStream for LdapEntryStream {
	async fn next(&mut self) -> Result<Option<StreamItem>, Error> {
		let Some(stream) = self.stream.as_mut() else {
			return Ok(None);
		};
		loop {
			match stream.next().await? {
				Some(entry) if entry.is_ref() => {
					return Ok(Some(StreamItem::Referral(ldap3::parse_refs(entry.0))));
				}
				Some(entry) if entry.is_intermediate() => continue,
				Some(entry) => return Ok(Some(StreamItem::Entry(SearchEntry::construct(entry)))),
				None => break,
			}
		}

		let Some(mut stream) = self.stream.take() else {
			return Ok(None);
		};
		let result = stream.finish().await;
		match result.rc {
			0 => Ok(None),
			crate::error::RC_REFERRAL => Ok(Some(StreamItem::Referral(result.refs))),
			_ => Err(Error::from_result(&result)),
		}
	}
}
