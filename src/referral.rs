//! Referral URLs and the bookkeeping that keeps referral chasing finite.
use std::{
	collections::{HashSet, VecDeque},
	fmt,
	hash::{Hash, Hasher},
	str::FromStr,
};

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::Error, transport::SearchScope};

/// What to do when the server answers with a referral.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralHandling {
	/// Stop quietly, as if the referral had not been sent.
	Ignore,
	/// Chase the referral and continue transparently.
	#[default]
	Follow,
	/// Hand the referral to the caller as [`Error::Referral`].
	Throw,
}

impl ReferralHandling {
	/// The mode name used by directory access APIs.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			ReferralHandling::Ignore => "ignore",
			ReferralHandling::Follow => "follow",
			ReferralHandling::Throw => "throw",
		}
	}
}

impl fmt::Display for ReferralHandling {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ReferralHandling {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ignore" => Ok(ReferralHandling::Ignore),
			"follow" => Ok(ReferralHandling::Follow),
			"throw" => Ok(ReferralHandling::Throw),
			other => Err(Error::Invalid(format!("Unknown referral handling {other}"))),
		}
	}
}

/// An LDAP URL (RFC 4516) taken from a referral.
///
/// Two referral URLs are equal when their full URL strings are equal.
#[derive(Clone, Debug)]
pub struct ReferralUrl {
	/// The URL exactly as the server sent it.
	raw: String,
	/// Whether the referral asks for `ldaps://`.
	pub secure: bool,
	/// Target host; empty means the server that sent the referral.
	pub host: String,
	/// Target port, defaulted from the scheme.
	pub port: u16,
	/// Base DN, empty if the referral keeps the original one.
	pub dn: String,
	/// Requested attributes, empty if the referral keeps the original ones.
	pub attributes: Vec<String>,
	/// Search scope, if the referral overrides it.
	pub scope: Option<SearchScope>,
	/// Search filter, if the referral overrides it.
	pub filter: Option<String>,
}

impl ReferralUrl {
	/// Parse an LDAP URL.
	pub fn parse(raw: &str) -> Result<Self, Error> {
		let invalid = || Error::InvalidUrl(raw.to_owned());
		let url = Url::parse(raw).map_err(|_| invalid())?;
		let secure = match url.scheme() {
			"ldap" => false,
			"ldaps" => true,
			_ => return Err(invalid()),
		};
		let host = url.host_str().unwrap_or_default().trim_matches(&['[', ']'][..]).to_owned();
		let port = url.port().unwrap_or(if secure { 636 } else { 389 });
		let dn = decode(url.path().trim_start_matches('/'))?;

		let mut parts = url.query().unwrap_or_default().splitn(4, '?');
		let attributes = decode(parts.next().unwrap_or_default())?
			.split(',')
			.map(str::trim)
			.filter(|attr| !attr.is_empty())
			.map(str::to_owned)
			.collect();
		let scope = match parts.next().unwrap_or_default() {
			"" => None,
			"base" => Some(SearchScope::Base),
			"one" => Some(SearchScope::OneLevel),
			"sub" => Some(SearchScope::Subtree),
			_ => return Err(invalid()),
		};
		let filter = Some(decode(parts.next().unwrap_or_default())?).filter(|f| !f.is_empty());

		Ok(Self { raw: raw.to_owned(), secure, host, port, dn, attributes, scope, filter })
	}

	/// The URL string as received.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.raw
	}
}

/// Percent-decode one URL component.
fn decode(component: &str) -> Result<String, Error> {
	percent_decode_str(component)
		.decode_utf8()
		.map(|decoded| decoded.into_owned())
		.map_err(|_| Error::InvalidUrl(component.to_owned()))
}

impl PartialEq for ReferralUrl {
	fn eq(&self, other: &Self) -> bool {
		self.raw == other.raw
	}
}

impl Eq for ReferralUrl {}

impl Hash for ReferralUrl {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.raw.hash(state);
	}
}

impl fmt::Display for ReferralUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.raw)
	}
}

impl FromStr for ReferralUrl {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

/// Referrals of one logical operation, including every hop it spawns.
///
/// A URL is either pending or processed, never both, and never queued
/// twice. Seeing it again means the servers redirect in a circle.
#[derive(Debug, Default)]
pub struct ReferralsInfo {
	/// Referrals waiting to be followed, first seen first.
	to_process: VecDeque<ReferralUrl>,
	/// Referrals already handed out by [`ReferralsInfo::next`].
	processed: Vec<ReferralUrl>,
	/// Every URL string in either of the two lists.
	seen: HashSet<String>,
}

impl ReferralsInfo {
	/// An empty tracker.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Queue a referral, failing with [`Error::LoopDetected`] if it is
	/// already pending or was already followed.
	pub fn add_referral(&mut self, url: ReferralUrl) -> Result<(), Error> {
		if !self.seen.insert(url.as_str().to_owned()) {
			return Err(Error::LoopDetected(url.as_str().to_owned()));
		}
		self.to_process.push_back(url);
		Ok(())
	}

	/// Parse and queue every URL of a referral response. URLs that cannot
	/// be parsed are skipped.
	pub fn add_referrals<S: AsRef<str>>(&mut self, urls: &[S]) -> Result<(), Error> {
		for raw in urls {
			match ReferralUrl::parse(raw.as_ref()) {
				Ok(url) => self.add_referral(url)?,
				Err(err) => tracing::warn!("Skipping referral: {err}"),
			}
		}
		Ok(())
	}

	/// Take the oldest pending referral and mark it processed.
	#[allow(clippy::should_implement_trait)]
	pub fn next(&mut self) -> Option<ReferralUrl> {
		let url = self.to_process.pop_front()?;
		self.processed.push(url.clone());
		Some(url)
	}

	/// Whether no referral is waiting.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.to_process.is_empty()
	}

	/// Referrals waiting to be followed.
	pub fn pending(&self) -> impl Iterator<Item = &ReferralUrl> {
		self.to_process.iter()
	}

	/// Referrals already followed, in the order they were handed out.
	#[must_use]
	pub fn processed(&self) -> &[ReferralUrl] {
		&self.processed
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{ReferralHandling, ReferralUrl, ReferralsInfo};
	use crate::{error::Error, transport::SearchScope};

	fn url(s: &str) -> ReferralUrl {
		ReferralUrl::parse(s).unwrap()
	}

	#[test]
	fn parses_full_url() -> Result<(), Box<dyn std::error::Error>> {
		let referral = ReferralUrl::parse(
			"ldap://dir2.example.com:1389/ou=People,dc=example,dc=com?cn,mail?one?(uid=j%20doe)",
		)?;
		assert!(!referral.secure);
		assert_eq!(referral.host, "dir2.example.com");
		assert_eq!(referral.port, 1389);
		assert_eq!(referral.dn, "ou=People,dc=example,dc=com");
		assert_eq!(referral.attributes, ["cn", "mail"]);
		assert_eq!(referral.scope, Some(SearchScope::OneLevel));
		assert_eq!(referral.filter.as_deref(), Some("(uid=j doe)"));
		Ok(())
	}

	#[test]
	fn parses_minimal_urls() -> Result<(), Box<dyn std::error::Error>> {
		let referral = ReferralUrl::parse("ldaps://dir3.example.com")?;
		assert!(referral.secure);
		assert_eq!(referral.port, 636);
		assert!(referral.dn.is_empty());
		assert!(referral.attributes.is_empty());
		assert_eq!(referral.scope, None);
		assert_eq!(referral.filter, None);

		let same_server = ReferralUrl::parse("ldap:///dc=example,dc=com")?;
		assert!(same_server.host.is_empty());
		assert_eq!(same_server.dn, "dc=example,dc=com");

		assert!(matches!(ReferralUrl::parse("http://example.com"), Err(Error::InvalidUrl(_))));
		assert!(matches!(
			ReferralUrl::parse("ldap://example.com/??nope"),
			Err(Error::InvalidUrl(_))
		));
		Ok(())
	}

	#[test]
	fn equality_uses_the_full_string() {
		assert_eq!(url("ldap://a.example.com/dc=a"), url("ldap://a.example.com/dc=a"));
		assert_ne!(url("ldap://a.example.com/dc=a"), url("ldap://a.example.com:389/dc=a"));
	}

	#[test]
	fn hands_out_referrals_first_in_first_out() -> Result<(), Error> {
		let mut info = ReferralsInfo::new();
		info.add_referral(url("ldap://one.example.com/"))?;
		info.add_referral(url("ldap://two.example.com/"))?;
		info.add_referral(url("ldap://three.example.com/"))?;

		assert_eq!(info.next().unwrap().host, "one.example.com");
		assert_eq!(info.next().unwrap().host, "two.example.com");
		assert_eq!(info.next().unwrap().host, "three.example.com");
		assert!(info.next().is_none());
		assert!(info.next().is_none(), "Exhausted tracker should stay exhausted");
		assert_eq!(info.processed().len(), 3);
		Ok(())
	}

	#[test]
	fn detects_loops() -> Result<(), Error> {
		let mut info = ReferralsInfo::new();
		info.add_referral(url("ldap://one.example.com/"))?;
		assert!(
			matches!(
				info.add_referral(url("ldap://one.example.com/")),
				Err(Error::LoopDetected(_))
			),
			"A pending referral must not be queued twice"
		);

		let followed = info.next().unwrap();
		assert!(
			matches!(info.add_referral(followed), Err(Error::LoopDetected(_))),
			"A processed referral must not be queued again"
		);
		assert!(info.is_empty());
		Ok(())
	}

	#[test]
	fn never_returns_a_url_twice() -> Result<(), Error> {
		let mut info = ReferralsInfo::new();
		let urls = ["ldap://a/", "ldap://b/", "ldap://a/", "ldap://c/", "ldap://b/"];
		let mut returned = Vec::new();
		for raw in urls {
			let _ = info.add_referral(url(raw));
			if let Some(next) = info.next() {
				returned.push(next.as_str().to_owned());
			}
		}
		while let Some(next) = info.next() {
			returned.push(next.as_str().to_owned());
		}
		assert_eq!(returned, ["ldap://a/", "ldap://b/", "ldap://c/"]);
		Ok(())
	}

	#[test]
	fn adds_parsable_referrals_only() -> Result<(), Error> {
		let mut info = ReferralsInfo::new();
		info.add_referrals(&["ldap://a.example.com/", "not a url"])?;
		assert_eq!(info.pending().count(), 1);
		let again = info.add_referrals(&["ldap://a.example.com/"]);
		assert!(matches!(again, Err(Error::LoopDetected(_))));
		Ok(())
	}

	#[test]
	fn referral_handling_names() -> Result<(), Error> {
		for mode in [ReferralHandling::Ignore, ReferralHandling::Follow, ReferralHandling::Throw] {
			assert_eq!(mode.as_str().parse::<ReferralHandling>()?, mode);
		}
		assert!("manage".parse::<ReferralHandling>().is_err());
		Ok(())
	}
}
