//! Search results and helpers for extracting data from them.
use std::sync::Arc;

use ldap3::SearchEntry;

use crate::config::ConnectionParameters;

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
pub trait SearchEntryExt {
	/// Get the first value of an attribute. Will return `None` if attribute
	/// value is not valid UTF-8.
	fn attr_first(&self, attr: &str) -> Option<&str>;

	/// Get the first value of an attribute, in binary form
	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]>;
}

impl SearchEntryExt for SearchEntry {
	fn attr_first(&self, attr: &str) -> Option<&str> {
		let attr = self.attrs.get(attr)?;
		attr.first().map(String::as_str)
	}

	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		if let Some(attr) = self.attrs.get(attr) {
			return attr.first().map(String::as_bytes);
		}

		if let Some(attr) = self.bin_attrs.get(attr) {
			return attr.first().map(Vec::as_slice);
		}
		None
	}
}

/// One entry yielded by a [`ResultStream`], together with the connection
/// that produced it.
///
/// [`ResultStream`]: crate::stream::ResultStream
#[derive(Debug, Clone)]
pub struct SearchResult {
	/// The entry as received.
	entry: SearchEntry,
	/// Parameters of the connection the entry came from. After following a
	/// referral this differs from the connection the search was issued on.
	connection: Arc<ConnectionParameters>,
	/// Whether the entry arrived through a followed referral.
	from_referral: bool,
}

impl SearchResult {
	/// Wrap an entry.
	#[must_use]
	pub fn new(
		entry: SearchEntry,
		connection: Arc<ConnectionParameters>,
		from_referral: bool,
	) -> Self {
		Self { entry, connection, from_referral }
	}

	/// Distinguished name of the entry.
	#[must_use]
	pub fn dn(&self) -> &str {
		&self.entry.dn
	}

	/// The raw entry.
	#[must_use]
	pub fn entry(&self) -> &SearchEntry {
		&self.entry
	}

	/// Take the raw entry.
	#[must_use]
	pub fn into_entry(self) -> SearchEntry {
		self.entry
	}

	/// The connection that produced the entry.
	#[must_use]
	pub fn connection(&self) -> &ConnectionParameters {
		&self.connection
	}

	/// Whether the entry arrived through a followed referral.
	#[must_use]
	pub fn is_from_referral(&self) -> bool {
		self.from_referral
	}

	/// All text values of an attribute.
	#[must_use]
	pub fn values(&self, attr: &str) -> &[String] {
		self.entry.attrs.get(attr).map_or(&[][..], Vec::as_slice)
	}
}

impl SearchEntryExt for SearchResult {
	fn attr_first(&self, attr: &str) -> Option<&str> {
		self.entry.attr_first(attr)
	}

	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		self.entry.bin_attr_first(attr)
	}
}
