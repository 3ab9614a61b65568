//! Iterating search results across referrals.
use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
	cache::ReferralResolver,
	config::ConnectionParameters,
	entry::SearchResult,
	error::Error,
	monitor::ProgressMonitor,
	referral::{ReferralHandling, ReferralsInfo},
	session::{Link, SharedSession},
	transport::{EntryStream, SearchRequest, StreamItem},
};

/// Entries of one search, lazily pulled from the server.
///
/// With [`ReferralHandling::Follow`] referrals are queued while the local
/// results are read and followed in the order they arrived once those are
/// exhausted. Entries from a followed referral carry the referred
/// connection. Any error ends the stream. Cancellation through the monitor
/// also closes the connections the stream reads from.
pub struct ResultStream {
	/// The stream currently read, `None` between sources.
	source: Option<Box<dyn EntryStream>>,
	/// Connection of the current source.
	connection: Arc<ConnectionParameters>,
	/// Transport of the session the search was issued on.
	origin: Option<Link>,
	/// Transport of the referral session the current source reads from.
	link: Option<Link>,
	/// Whether the current source is a followed referral.
	from_referral: bool,
	/// The search as issued, adapted for every referral followed.
	request: SearchRequest,
	/// What to do about referrals.
	handling: ReferralHandling,
	/// Referrals of this search.
	referrals: ReferralsInfo,
	/// Provides sessions for following referrals.
	resolver: Option<Arc<dyn ReferralResolver>>,
	/// Cancels the iteration.
	monitor: ProgressMonitor,
	/// Session serving the current referral source.
	referral_session: Option<SharedSession>,
	/// Set once the stream has ended, normally or not.
	done: bool,
}

impl fmt::Debug for ResultStream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ResultStream")
			.field("connection", &self.connection.display_name())
			.field("from_referral", &self.from_referral)
			.field("handling", &self.handling)
			.field("referrals", &self.referrals)
			.field("done", &self.done)
			.finish_non_exhaustive()
	}
}

impl ResultStream {
	/// A stream without a source yet.
	pub(crate) fn new(
		connection: Arc<ConnectionParameters>,
		origin: Option<Link>,
		request: SearchRequest,
		handling: ReferralHandling,
		referrals: ReferralsInfo,
		resolver: Option<Arc<dyn ReferralResolver>>,
		monitor: ProgressMonitor,
	) -> Self {
		Self {
			source: None,
			connection,
			origin,
			link: None,
			from_referral: false,
			request,
			handling,
			referrals,
			resolver,
			monitor,
			referral_session: None,
			done: false,
		}
	}

	/// Read from `source` next, served over `link` if it belongs to a
	/// referral session.
	pub(crate) fn set_source(&mut self, source: Box<dyn EntryStream>, link: Option<Link>) {
		self.source = Some(source);
		self.link = link;
	}

	/// Act on a referral according to the referral handling.
	pub(crate) fn on_referral(&mut self, urls: Vec<String>) -> Result<(), Error> {
		match self.handling {
			ReferralHandling::Ignore => {
				debug!("Ignoring referral to {}", urls.join(", "));
				self.finish();
				Ok(())
			}
			ReferralHandling::Throw => {
				self.finish();
				Err(Error::Referral(urls))
			}
			ReferralHandling::Follow => {
				let queued = self.referrals.add_referrals(&urls);
				if queued.is_err() {
					self.finish();
				}
				queued
			}
		}
	}

	/// The referral tracker of this search.
	#[must_use]
	pub fn referrals(&self) -> &ReferralsInfo {
		&self.referrals
	}

	/// Whether the stream has ended.
	#[must_use]
	pub fn is_done(&self) -> bool {
		self.done
	}

	/// The next entry, `None` once every source is exhausted.
	pub async fn next(&mut self) -> Result<Option<SearchResult>, Error> {
		loop {
			if self.done {
				return Ok(None);
			}
			if self.monitor.is_cancelled() {
				return Err(self.fail(Error::Cancelled).await);
			}

			let Some(source) = self.source.as_mut() else {
				match self.follow_next_referral().await {
					Ok(true) => continue,
					Ok(false) => {
						self.finish();
						return Ok(None);
					}
					Err(err) => return Err(self.fail(err).await),
				}
			};

			let item = tokio::select! {
				biased;
				() = self.monitor.cancelled() => Err(Error::Cancelled),
				item = source.next() => item,
			};

			match item {
				Ok(Some(StreamItem::Entry(entry))) => {
					return Ok(Some(SearchResult::new(
						entry,
						self.connection.clone(),
						self.from_referral,
					)));
				}
				Ok(Some(StreamItem::Referral(urls))) => match self.on_referral(urls) {
					Ok(()) => {}
					Err(Error::Referral(urls)) => return Err(Error::Referral(urls)),
					Err(err) => return Err(self.fail(err).await),
				},
				Ok(None) => self.source = None,
				Err(err) => return Err(self.fail(err).await),
			}
		}
	}

	/// Drain the stream.
	pub async fn collect_all(mut self) -> Result<Vec<SearchResult>, Error> {
		let mut results = Vec::new();
		while let Some(result) = self.next().await? {
			results.push(result);
		}
		Ok(results)
	}

	/// Switch to the next resolvable pending referral. Returns whether a
	/// new source was opened.
	async fn follow_next_referral(&mut self) -> Result<bool, Error> {
		if self.referrals.is_empty() {
			return Ok(false);
		}
		let Some(resolver) = self.resolver.clone() else {
			warn!("Cannot follow referrals of {}: no resolver", self.connection.display_name());
			return Ok(false);
		};

		while let Some(url) = self.referrals.next() {
			let Some(session) = resolver.resolve(&url, &self.monitor).await? else {
				debug!("No connection for referral {url}");
				continue;
			};
			let request = self.request.for_referral(&url);
			let (connection, source, link) = {
				let mut session = session.lock().await;
				let source = session.open_search(&request, &self.monitor).await?;
				(session.params().clone(), source, session.link())
			};
			info!("Following referral {url}");
			self.set_source(source, link);
			self.connection = connection;
			self.from_referral = true;
			self.referral_session = Some(session);
			return Ok(true);
		}
		Ok(false)
	}

	/// End the stream because of `err`. A cancelled stream leaves its
	/// connections in an unknown state, so they are closed.
	async fn fail(&mut self, err: Error) -> Error {
		self.source = None;
		if matches!(err, Error::Cancelled) {
			debug!("Reading results from {} cancelled", self.connection.display_name());
			for link in [self.link.take(), self.origin.take()].into_iter().flatten() {
				link.close().await;
			}
		}
		self.finish();
		self.monitor.report_error("Reading search results failed", &err);
		err
	}

	/// End the stream and release its sources.
	fn finish(&mut self) {
		self.source = None;
		self.link = None;
		self.origin = None;
		self.referral_session = None;
		self.done = true;
	}
}
