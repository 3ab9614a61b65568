//! The connection state machine: connecting, binding, and running directory
//! operations with cancellation and a single reconnect on transient
//! failures.
use std::{
	fmt,
	future::Future,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	cache::ReferralResolver,
	config::{AuthMethod, ConnectionParameters, EncryptionMethod},
	credentials::CredentialsProvider,
	error::Error,
	monitor::ProgressMonitor,
	oplog::{OperationLogger, OperationRecord, WriteOperation},
	referral::{ReferralHandling, ReferralsInfo},
	stream::ResultStream,
	transport::{
		Attribute, BindRequest, Connector, EntryStream, Modification, SearchRequest, Transport,
		TransportTarget,
	},
	trust::{CertificateChecks, TrustCallback, TrustDecisionInterceptor, TrustStores, WebPkiChecks},
};

/// Number of the next search, for correlating log lines.
static SEARCH_REQUEST_NUMBER: AtomicU64 = AtomicU64::new(0);

/// A session that can be used from several places, such as referral hops.
pub type SharedSession = Arc<Mutex<ConnectionSession>>;

/// The outside parties a session works with. Cheap to clone; the trust
/// stores in particular are shared by every session created from clones.
#[derive(Clone, Default)]
pub struct Collaborators {
	/// Provides credentials when binding.
	pub credentials: Option<Arc<dyn CredentialsProvider>>,
	/// Decides about server certificates that fail verification.
	pub trust_callback: Option<Arc<dyn TrustCallback>>,
	/// Manually accepted certificates.
	pub trust_stores: TrustStores,
	/// Certificate checks; defaults to webpki against the configured roots.
	pub certificate_checks: Option<Arc<dyn CertificateChecks>>,
	/// Provides sessions for following referrals.
	pub referrals: Option<Arc<dyn ReferralResolver>>,
	/// Receives completed write operations.
	pub logger: Option<Arc<dyn OperationLogger>>,
}

impl fmt::Debug for Collaborators {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Collaborators")
			.field("credentials", &self.credentials.is_some())
			.field("trust_callback", &self.trust_callback.is_some())
			.field("trust_stores", &self.trust_stores)
			.field("certificate_checks", &self.certificate_checks.is_some())
			.field("referrals", &self.referrals.is_some())
			.field("logger", &self.logger.is_some())
			.finish()
	}
}

/// An open transport, shared between a session and the result streams
/// reading from it. Closing it through any holder disconnects the session.
#[derive(Debug, Clone)]
pub(crate) struct Link {
	/// The transport.
	transport: Arc<dyn Transport>,
	/// Cancelled once the transport has been closed.
	closed: CancellationToken,
}

impl Link {
	/// Link an opened transport.
	fn new(transport: Arc<dyn Transport>) -> Self {
		Self { transport, closed: CancellationToken::new() }
	}

	/// Whether the transport has been closed.
	fn is_closed(&self) -> bool {
		self.closed.is_cancelled()
	}

	/// Close the transport unless it already is.
	pub(crate) async fn close(&self) {
		if !self.is_closed() {
			self.closed.cancel();
			self.transport.close().await;
		}
	}
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// No transport.
	Disconnected,
	/// Opening the transport and negotiating TLS.
	Connecting,
	/// Transport open, not authenticated.
	Connected,
	/// Transport open and authenticated.
	Bound,
}

/// One logical connection to a directory server.
///
/// Operations take `&mut self`, so a session runs at most one operation at
/// a time; share it behind a [`SharedSession`] to use it from several
/// tasks.
pub struct ConnectionSession {
	/// Connection configuration.
	params: Arc<ConnectionParameters>,
	/// Opens transports.
	connector: Arc<dyn Connector>,
	/// Credentials, trust, referral and logging collaborators.
	collaborators: Collaborators,
	/// The live transport, `None` while disconnected.
	link: Option<Link>,
	/// Lifecycle state.
	state: SessionState,
	/// The bind that authenticated the current transport.
	environment: Option<BindRequest>,
}

impl fmt::Debug for ConnectionSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionSession")
			.field("params", &self.params)
			.field("state", &self.state)
			.field("environment", &self.environment)
			.finish_non_exhaustive()
	}
}

impl ConnectionSession {
	/// A disconnected session.
	pub fn new(
		params: impl Into<Arc<ConnectionParameters>>,
		connector: Arc<dyn Connector>,
		collaborators: Collaborators,
	) -> Self {
		Self {
			params: params.into(),
			connector,
			collaborators,
			link: None,
			state: SessionState::Disconnected,
			environment: None,
		}
	}

	/// Put the session behind a mutex for sharing.
	#[must_use]
	pub fn into_shared(self) -> SharedSession {
		Arc::new(Mutex::new(self))
	}

	/// Connection configuration.
	#[must_use]
	pub fn params(&self) -> &Arc<ConnectionParameters> {
		&self.params
	}

	/// Collaborators of this session.
	#[must_use]
	pub fn collaborators(&self) -> &Collaborators {
		&self.collaborators
	}

	/// The connector transports are opened with.
	#[must_use]
	pub fn connector(&self) -> &Arc<dyn Connector> {
		&self.connector
	}

	/// Lifecycle state.
	#[must_use]
	pub fn state(&self) -> SessionState {
		if self.link.as_ref().is_some_and(Link::is_closed) {
			SessionState::Disconnected
		} else {
			self.state
		}
	}

	/// Whether a transport is open.
	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.transport().is_some()
	}

	/// Principal of the current bind, if bound.
	#[must_use]
	pub fn bound_principal(&self) -> Option<&str> {
		let environment = self.environment.as_ref().filter(|_| self.is_connected());
		environment.map(|bind| bind.principal.as_str())
	}

	/// The open transport.
	fn transport(&self) -> Option<Arc<dyn Transport>> {
		self.link.as_ref().filter(|link| !link.is_closed()).map(|link| link.transport.clone())
	}

	/// The open transport for handing to a result stream.
	pub(crate) fn link(&self) -> Option<Link> {
		self.link.clone().filter(|link| !link.is_closed())
	}

	/// Open the transport, negotiating TLS as configured. A failed StartTLS
	/// negotiation fails the connect; it is not retried.
	pub async fn connect(&mut self, monitor: &ProgressMonitor) -> Result<(), Error> {
		let result = self.open(monitor).await;
		if let Err(err) = &result {
			let message = format!("Connecting to {} failed", self.params.display_name());
			monitor.report_error(&message, err);
		}
		result
	}

	/// Open the transport without reporting failures.
	async fn open(&mut self, monitor: &ProgressMonitor) -> Result<(), Error> {
		if monitor.is_cancelled() {
			return Err(Error::Cancelled);
		}
		self.disconnect().await;
		self.state = SessionState::Connecting;

		let result = match self.target().await {
			Ok(target) => {
				info!("Connecting to {} ({:?})", target.url, target.encryption);
				tokio::select! {
					biased;
					() = monitor.cancelled() => Err(Error::Cancelled),
					result = self.connector.connect(&target) => result,
				}
			}
			Err(err) => Err(err),
		};

		match result {
			Ok(transport) => {
				self.link = Some(Link::new(transport));
				self.state = SessionState::Connected;
				Ok(())
			}
			Err(err) => {
				self.state = SessionState::Disconnected;
				Err(err)
			}
		}
	}

	/// Where to connect, with certificate verification for encrypted
	/// connections.
	async fn target(&self) -> Result<TransportTarget, Error> {
		let verifier = if self.params.encryption != EncryptionMethod::None
			&& self.params.tls.validate_certificates
		{
			let checks: Arc<dyn CertificateChecks> = match &self.collaborators.certificate_checks {
				Some(checks) => checks.clone(),
				None => Arc::new(WebPkiChecks::new(self.params.tls.root_store().await?)),
			};
			Some(Arc::new(TrustDecisionInterceptor::new(
				self.params.host.clone(),
				checks,
				self.collaborators.trust_stores.clone(),
				self.collaborators.trust_callback.clone(),
			)))
		} else {
			None
		};

		Ok(TransportTarget {
			url: self.params.url()?,
			host: self.params.host.clone(),
			encryption: self.params.encryption,
			connect_timeout: self.params.connect_timeout(),
			verifier,
		})
	}

	/// Authenticate the open transport. Any previous credentials are
	/// dropped first. On failure the session is disconnected.
	pub async fn bind(&mut self, monitor: &ProgressMonitor) -> Result<(), Error> {
		let result = self.authenticate(monitor).await;
		if let Err(err) = &result {
			monitor.report_error(&format!("Binding to {} failed", self.params.display_name()), err);
		}
		result
	}

	/// Bind without reporting failures.
	async fn authenticate(&mut self, monitor: &ProgressMonitor) -> Result<(), Error> {
		let Some(transport) = self.transport() else {
			return Err(Error::NotConnected);
		};
		self.environment = None;

		let result = match self.bind_request() {
			Ok(request) => {
				let mechanism = request.method.mechanism();
				debug!("Binding to {} with {mechanism}", self.params.display_name());
				let result = tokio::select! {
					biased;
					() = monitor.cancelled() => Err(Error::Cancelled),
					result = transport.bind(&request) => result,
				};
				result.map(|()| request)
			}
			Err(err) => Err(err),
		};

		match result {
			Ok(request) => {
				self.environment = Some(request);
				self.state = SessionState::Bound;
				Ok(())
			}
			Err(err) => {
				self.disconnect().await;
				Err(err)
			}
		}
	}

	/// Assemble the bind for the configured authentication method.
	fn bind_request(&self) -> Result<BindRequest, Error> {
		let method = self.params.auth;
		let (principal, credentials) = if method == AuthMethod::None {
			(String::new(), String::new())
		} else {
			let provider =
				self.collaborators.credentials.as_ref().ok_or(Error::AuthenticationUnavailable)?;
			let credentials =
				provider.credentials(&self.params).ok_or(Error::AuthenticationUnavailable)?;
			(credentials.principal, credentials.secret)
		};
		let sasl = &self.params.sasl;
		Ok(BindRequest {
			method,
			principal,
			credentials,
			realm: sasl.realm.clone().filter(|realm| !realm.is_empty()),
			qop: sasl.qop,
			strength: sasl.strength,
			mutual_authentication: sasl.mutual_authentication,
		})
	}

	/// End the session. Same as [`ConnectionSession::disconnect`].
	pub async fn unbind(&mut self) {
		self.disconnect().await;
	}

	/// Close the transport and forget the bind. Safe to call when already
	/// disconnected.
	pub async fn disconnect(&mut self) {
		if let Some(link) = self.link.take() {
			debug!("Disconnecting from {}", self.params.display_name());
			link.close().await;
		}
		self.environment = None;
		self.state = SessionState::Disconnected;
	}

	/// Run one network operation under the monitor.
	///
	/// Connects and binds first if needed. A transient failure of the first
	/// attempt causes one reconnect and one retry; whatever the retry
	/// returns is final. Cancellation drops the operation, closes the
	/// transport and returns [`Error::Cancelled`].
	async fn run<T, F, Fut>(
		&mut self,
		monitor: &ProgressMonitor,
		mut operation: F,
	) -> Result<T, Error>
	where
		F: FnMut(Arc<dyn Transport>) -> Fut,
		Fut: Future<Output = Result<T, Error>>,
	{
		if monitor.is_cancelled() {
			return Err(Error::Cancelled);
		}
		if !self.is_connected() {
			self.open(monitor).await?;
			self.authenticate(monitor).await?;
		}

		let mut retried = false;
		loop {
			let transport = self.transport().ok_or(Error::NotConnected)?;
			let outcome = tokio::select! {
				biased;
				() = monitor.cancelled() => None,
				result = operation(transport) => Some(result),
			};

			let result = match outcome {
				Some(result) if !monitor.is_cancelled() => result,
				_ => {
					debug!("Operation on {} cancelled", self.params.display_name());
					self.disconnect().await;
					return Err(Error::Cancelled);
				}
			};
			match result {
				Err(err) if !retried && err.is_transient() => {
					warn!("{err}, reconnecting to {}", self.params.display_name());
					retried = true;
					self.open(monitor).await?;
					self.authenticate(monitor).await?;
				}
				result => return result,
			}
		}
	}

	/// Search the directory. Referrals met while iterating the returned
	/// stream are handled as `referral_handling` says, tracked in
	/// `referrals_info` (a fresh tracker if `None`).
	pub async fn search(
		&mut self,
		request: SearchRequest,
		referral_handling: ReferralHandling,
		monitor: &ProgressMonitor,
		referrals_info: Option<ReferralsInfo>,
	) -> Result<ResultStream, Error> {
		let request_number = SEARCH_REQUEST_NUMBER.fetch_add(1, Ordering::Relaxed);
		debug!(
			request_number,
			base = %request.base,
			filter = %request.filter,
			scope = ?request.scope,
			deref = request.deref.as_str(),
			referrals = referral_handling.as_str(),
			"Search request on {}",
			self.params.display_name()
		);

		let source = self.open_search(&request, monitor).await;
		let mut stream = ResultStream::new(
			self.params.clone(),
			self.link(),
			request,
			referral_handling,
			referrals_info.unwrap_or_default(),
			self.collaborators.referrals.clone(),
			monitor.clone(),
		);
		let result = match source {
			Ok(source) => {
				stream.set_source(source, None);
				Ok(())
			}
			Err(Error::Referral(urls)) => match stream.on_referral(urls) {
				Err(Error::Referral(urls)) => return Err(Error::Referral(urls)),
				result => result,
			},
			Err(err) => Err(err),
		};
		if let Err(err) = result {
			monitor.report_error("Search failed", &err);
			return Err(err);
		}
		Ok(stream)
	}

	/// Start a search and return the raw stream of the transport.
	pub(crate) async fn open_search(
		&mut self,
		request: &SearchRequest,
		monitor: &ProgressMonitor,
	) -> Result<Box<dyn EntryStream>, Error> {
		self.run(monitor, |transport| async move { transport.search(request).await }).await
	}

	/// Change attributes of an entry.
	pub async fn modify(
		&mut self,
		dn: &str,
		changes: &[Modification],
		monitor: &ProgressMonitor,
	) -> Result<(), Error> {
		let operation = WriteOperation::Modify { dn: dn.to_owned(), changes: changes.to_vec() };
		self.write(operation, monitor).await
	}

	/// Rename or move an entry.
	pub async fn rename(
		&mut self,
		old_dn: &str,
		new_dn: &str,
		delete_old_rdn: bool,
		monitor: &ProgressMonitor,
	) -> Result<(), Error> {
		let operation = WriteOperation::Rename {
			old_dn: old_dn.to_owned(),
			new_dn: new_dn.to_owned(),
			delete_old_rdn,
		};
		self.write(operation, monitor).await
	}

	/// Create an entry.
	pub async fn create(
		&mut self,
		dn: &str,
		attributes: &[Attribute],
		monitor: &ProgressMonitor,
	) -> Result<(), Error> {
		let operation = WriteOperation::Add { dn: dn.to_owned(), attributes: attributes.to_vec() };
		self.write(operation, monitor).await
	}

	/// Delete an entry.
	pub async fn delete(&mut self, dn: &str, monitor: &ProgressMonitor) -> Result<(), Error> {
		self.write(WriteOperation::Delete { dn: dn.to_owned() }, monitor).await
	}

	/// Run a write operation, following referrals.
	async fn write(
		&mut self,
		operation: WriteOperation,
		monitor: &ProgressMonitor,
	) -> Result<(), Error> {
		let result = if self.params.read_only {
			Err(Error::ReadOnly(self.params.display_name()))
		} else {
			match self.submit(&operation, monitor).await {
				Err(Error::Referral(urls)) => {
					self.follow_write_referral(&operation, urls, monitor).await
				}
				result => result,
			}
		};
		if let Err(err) = &result {
			let message = format!("{} of {} failed", operation.kind(), operation.dn());
			monitor.report_error(&message, err);
		}
		result
	}

	/// Execute a write on this session and log the outcome. Referrals and
	/// cancellation are returned without logging.
	async fn submit(
		&mut self,
		operation: &WriteOperation,
		monitor: &ProgressMonitor,
	) -> Result<(), Error> {
		let result = self
			.run(monitor, |transport| async move { execute(&*transport, operation).await })
			.await;
		if !matches!(result, Err(Error::Referral(_) | Error::Cancelled)) {
			self.log(operation, result.as_ref().map(|_| ()));
		}
		result
	}

	/// Handle a referral answered to a write operation. Every hop is
	/// resolved here, and a referred session is locked only while the write
	/// is submitted to it.
	async fn follow_write_referral(
		&self,
		operation: &WriteOperation,
		urls: Vec<String>,
		monitor: &ProgressMonitor,
	) -> Result<(), Error> {
		match self.params.referral_handling {
			ReferralHandling::Ignore => {
				debug!("Ignoring referral for {} of {}", operation.kind(), operation.dn());
				return Ok(());
			}
			ReferralHandling::Throw => return Err(Error::Referral(urls)),
			ReferralHandling::Follow => {}
		}

		let mut referrals = ReferralsInfo::new();
		referrals.add_referrals(&urls)?;
		let Some(resolver) = self.collaborators.referrals.clone() else {
			return Err(Error::Referral(urls));
		};
		let mut current = operation.clone();
		let mut last = urls;
		while let Some(url) = referrals.next() {
			let Some(session) = resolver.resolve(&url, monitor).await? else {
				debug!("No connection for referral {url}");
				continue;
			};
			info!("Following referral {url} for {} of {}", current.kind(), current.dn());
			let target =
				if url.dn.is_empty() { current.clone() } else { current.retarget(&url.dn) };
			let result = session.lock().await.submit(&target, monitor).await;
			match result {
				Err(Error::Referral(urls)) => {
					referrals.add_referrals(&urls)?;
					current = target;
					last = urls;
				}
				result => return result,
			}
		}
		Err(Error::Referral(last))
	}

	/// Hand a completed write to the operation logger.
	fn log(&self, operation: &WriteOperation, outcome: Result<(), &Error>) {
		if let Some(logger) = &self.collaborators.logger {
			logger.log(&OperationRecord { connection: &self.params, operation, outcome });
		}
	}
}

/// Send a write operation over the transport.
async fn execute(transport: &dyn Transport, operation: &WriteOperation) -> Result<(), Error> {
	match operation {
		WriteOperation::Add { dn, attributes } => transport.add(dn, attributes).await,
		WriteOperation::Modify { dn, changes } => transport.modify(dn, changes).await,
		WriteOperation::Delete { dn } => transport.delete(dn).await,
		WriteOperation::Rename { old_dn, new_dn, delete_old_rdn } => {
			transport.rename(old_dn, new_dn, *delete_old_rdn).await
		}
	}
}
