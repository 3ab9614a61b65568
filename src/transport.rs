//! The seam between the session logic and the wire.
//!
//! A [`Connector`] opens a [`Transport`], which carries out single protocol
//! exchanges. Everything above this module (retry, cancellation, referral
//! chasing) only talks to these traits; [`crate::ldap`] implements them on
//! top of `ldap3`.
use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
	config::{AuthMethod, EncryptionMethod, SaslQop, SaslStrength},
	error::Error,
	referral::ReferralUrl,
	trust::TrustDecisionInterceptor,
};

/// Where and how to open a transport.
#[derive(Clone, Debug)]
pub struct TransportTarget {
	/// `ldap://` or `ldaps://` URL of the server.
	pub url: Url,
	/// Host name the server certificate must match.
	pub host: String,
	/// Channel security.
	pub encryption: EncryptionMethod,
	/// Timeout for opening the channel.
	pub connect_timeout: Duration,
	/// Certificate verification for TLS. `None` accepts any certificate.
	pub verifier: Option<Arc<TrustDecisionInterceptor>>,
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
	/// Open a channel to the target, negotiating TLS as configured. A
	/// failed TLS negotiation must leave nothing open behind.
	async fn connect(&self, target: &TransportTarget) -> Result<Arc<dyn Transport>, Error>;
}

/// One open channel to a directory server.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
	/// Authenticate the channel.
	async fn bind(&self, request: &BindRequest) -> Result<(), Error>;
	/// Start a search. Entries and referrals arrive through the stream.
	async fn search(&self, request: &SearchRequest) -> Result<Box<dyn EntryStream>, Error>;
	/// Add an entry.
	async fn add(&self, dn: &str, attributes: &[Attribute]) -> Result<(), Error>;
	/// Modify an entry.
	async fn modify(&self, dn: &str, changes: &[Modification]) -> Result<(), Error>;
	/// Delete an entry.
	async fn delete(&self, dn: &str) -> Result<(), Error>;
	/// Rename or move an entry.
	async fn rename(&self, old_dn: &str, new_dn: &str, delete_old_rdn: bool) -> Result<(), Error>;
	/// Close the channel. Closing twice is harmless.
	async fn close(&self);
}

/// Results of one search as the transport delivers them.
#[async_trait]
pub trait EntryStream: Send + fmt::Debug {
	/// The next item, `None` once the search is done.
	async fn next(&mut self) -> Result<Option<StreamItem>, Error>;
}

/// One element of a search response.
#[derive(Debug, Clone)]
pub enum StreamItem {
	/// A directory entry.
	Entry(SearchEntry),
	/// A referral or search continuation reference with its LDAP URLs.
	Referral(Vec<String>),
}

/// Credentials and SASL options for one bind exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct BindRequest {
	/// Authentication method.
	pub method: AuthMethod,
	/// Bind DN or SASL user name.
	pub principal: String,
	/// Password.
	pub credentials: String,
	/// SASL realm for DIGEST-MD5.
	pub realm: Option<String>,
	/// SASL quality of protection.
	pub qop: SaslQop,
	/// SASL cipher strength.
	pub strength: SaslStrength,
	/// Whether the server has to authenticate itself too.
	pub mutual_authentication: bool,
}

impl fmt::Debug for BindRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BindRequest")
			.field("method", &self.method)
			.field("principal", &self.principal)
			.field("realm", &self.realm)
			.field("qop", &self.qop)
			.finish_non_exhaustive()
	}
}

/// Search scope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
	/// Only the base entry.
	Base,
	/// Direct children of the base entry.
	OneLevel,
	/// The base entry and everything below it.
	#[default]
	Subtree,
}

/// How aliases are dereferenced during a search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasDereferencing {
	/// Never dereference.
	Never,
	/// Dereference below the base, but not the base itself.
	Searching,
	/// Dereference the base only.
	Finding,
	/// Always dereference.
	#[default]
	Always,
}

impl AliasDereferencing {
	/// The method name used by directory access APIs.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			AliasDereferencing::Never => "never",
			AliasDereferencing::Searching => "searching",
			AliasDereferencing::Finding => "finding",
			AliasDereferencing::Always => "always",
		}
	}
}

/// Parameters of a search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
	/// Base DN
	pub base: String,
	/// Filter in RFC 4515 string form.
	pub filter: String,
	/// Scope
	pub scope: SearchScope,
	/// Attributes to return; empty returns all user attributes.
	pub attributes: Vec<String>,
	/// Alias dereferencing
	pub deref: AliasDereferencing,
	/// Maximum number of entries, 0 for no limit.
	pub size_limit: i32,
	/// Maximum duration in seconds, 0 for no limit.
	pub time_limit: i32,
}

impl Default for SearchRequest {
	fn default() -> Self {
		Self {
			base: String::new(),
			filter: "(objectClass=*)".to_owned(),
			scope: SearchScope::Subtree,
			attributes: Vec::new(),
			deref: AliasDereferencing::Always,
			size_limit: 0,
			time_limit: 0,
		}
	}
}

impl SearchRequest {
	/// A subtree search below `base` with the given filter.
	pub fn new(base: impl Into<String>, filter: impl Into<String>) -> Self {
		Self { base: base.into(), filter: filter.into(), ..Self::default() }
	}

	/// The equivalent search against the target of a referral. Base,
	/// filter, scope and attributes of the URL take precedence; limits and
	/// alias dereferencing carry over.
	#[must_use]
	pub fn for_referral(&self, url: &ReferralUrl) -> Self {
		Self {
			base: if url.dn.is_empty() { self.base.clone() } else { url.dn.clone() },
			filter: url.filter.clone().unwrap_or_else(|| self.filter.clone()),
			scope: url.scope.unwrap_or(self.scope),
			attributes: if url.attributes.is_empty() {
				self.attributes.clone()
			} else {
				url.attributes.clone()
			},
			..self.clone()
		}
	}
}

/// An attribute with its values, as used when adding entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
	/// Attribute type
	pub name: String,
	/// Values
	pub values: Vec<String>,
}

impl Attribute {
	/// An attribute with the given values.
	pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
	where
		I: IntoIterator<Item = V>,
		V: Into<String>,
	{
		Self { name: name.into(), values: values.into_iter().map(Into::into).collect() }
	}
}

/// One change of a modify operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modification {
	/// Add values to an attribute.
	Add(Attribute),
	/// Remove values from an attribute; no values removes the attribute.
	Delete(Attribute),
	/// Replace all values of an attribute.
	Replace(Attribute),
	/// Increment a numeric attribute by the given amount.
	Increment {
		/// Attribute type
		name: String,
		/// Amount to add
		amount: String,
	},
}

/// Split a DN into its first RDN and the parent DN, honouring escaped
/// commas.
pub(crate) fn split_rdn(dn: &str) -> (&str, &str) {
	let mut escaped = false;
	for (idx, ch) in dn.char_indices() {
		match ch {
			'\\' if !escaped => escaped = true,
			',' if !escaped => return (dn[..idx].trim(), dn[idx + 1..].trim()),
			_ => escaped = false,
		}
	}
	(dn.trim(), "")
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{split_rdn, SearchRequest, SearchScope};
	use crate::referral::ReferralUrl;

	#[test]
	fn splits_rdn_from_parent() {
		assert_eq!(split_rdn("cn=foo,ou=people,dc=example"), ("cn=foo", "ou=people,dc=example"));
		assert_eq!(split_rdn(r"cn=Doe\, John,dc=example"), (r"cn=Doe\, John", "dc=example"));
		assert_eq!(split_rdn(r"cn=back\\,dc=example"), (r"cn=back\\", "dc=example"));
		assert_eq!(split_rdn("dc=com"), ("dc=com", ""));
	}

	#[test]
	fn referral_search_keeps_what_the_url_leaves_open() {
		let original = SearchRequest {
			attributes: vec!["cn".to_owned()],
			size_limit: 50,
			..SearchRequest::new("dc=example,dc=com", "(uid=*)")
		};

		let url = ReferralUrl::parse("ldap://other.example.com/ou=remote,dc=example,dc=com")
			.unwrap();
		let referred = original.for_referral(&url);
		assert_eq!(referred.base, "ou=remote,dc=example,dc=com");
		assert_eq!(referred.filter, "(uid=*)");
		assert_eq!(referred.scope, SearchScope::Subtree);
		assert_eq!(referred.attributes, ["cn"]);
		assert_eq!(referred.size_limit, 50);

		let url = ReferralUrl::parse("ldap://other.example.com/??base?(cn=x)").unwrap();
		let referred = original.for_referral(&url);
		assert_eq!(referred.base, "dc=example,dc=com");
		assert_eq!(referred.filter, "(cn=x)");
		assert_eq!(referred.scope, SearchScope::Base);
	}
}
