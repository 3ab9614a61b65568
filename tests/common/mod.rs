use std::{
	collections::{HashMap, VecDeque},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::SystemTime,
};

use async_trait::async_trait;
use ldap_session::{
	config::{AuthMethod, ConnectionParameters, EncryptionMethod},
	credentials::{Credentials, CredentialsProvider},
	error::Error,
	oplog::{OperationLogger, OperationRecord},
	transport::{
		Attribute, BindRequest, Connector, EntryStream, Modification, SearchRequest, StreamItem,
		Transport, TransportTarget,
	},
	trust::{CertificateChecks, TrustCallback, TrustDecision, TrustFailureCause},
	SearchEntry,
};
use rustls::{Certificate, CertificateError};

/// Builds the error a scripted failure stands for.
pub type Failure = fn() -> Error;

pub fn connection_lost() -> Error {
	Error::Connection("connection reset by peer".to_owned())
}

pub fn no_such_object() -> Error {
	Error::Protocol { code: 32, message: "no such object".to_owned(), matched: String::new() }
}

pub fn invalid_credentials() -> Error {
	Error::Authentication("invalid credentials".to_owned())
}

/// What one fake server does and what happened to it.
#[derive(Debug, Default)]
pub struct Server {
	pub connects: AtomicUsize,
	pub closes: AtomicUsize,
	pub binds: Mutex<Vec<BindRequest>>,
	pub searches: Mutex<Vec<SearchRequest>>,
	pub writes: Mutex<Vec<String>>,
	pub connect_failures: Mutex<VecDeque<Failure>>,
	pub bind_failures: Mutex<VecDeque<Failure>>,
	pub operation_failures: Mutex<VecDeque<Failure>>,
	/// Search results by base DN.
	pub results: Mutex<HashMap<String, Vec<StreamItem>>>,
	/// Referrals answered to writes, by DN.
	pub write_referrals: Mutex<HashMap<String, Vec<String>>>,
	/// Certificate chain presented during TLS negotiation.
	pub chain: Mutex<Option<Vec<Certificate>>>,
	/// Operations never complete.
	pub hang: AtomicBool,
}

impl Server {
	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}

	pub fn writes(&self) -> Vec<String> {
		self.writes.lock().unwrap().clone()
	}

	pub fn fail_connect(&self, failure: Failure) {
		self.connect_failures.lock().unwrap().push_back(failure);
	}

	pub fn fail_bind(&self, failure: Failure) {
		self.bind_failures.lock().unwrap().push_back(failure);
	}

	pub fn fail_operation(&self, failure: Failure) {
		self.operation_failures.lock().unwrap().push_back(failure);
	}

	pub fn answer(&self, base: &str, items: Vec<StreamItem>) {
		self.results.lock().unwrap().insert(base.to_owned(), items);
	}

	pub fn refer_write(&self, dn: &str, urls: &[&str]) {
		self.write_referrals
			.lock()
			.unwrap()
			.insert(dn.to_owned(), urls.iter().map(|url| (*url).to_owned()).collect());
	}

	pub fn present(&self, chain: Vec<Certificate>) {
		*self.chain.lock().unwrap() = Some(chain);
	}

	fn next_failure(queue: &Mutex<VecDeque<Failure>>) -> Result<(), Error> {
		match queue.lock().unwrap().pop_front() {
			Some(failure) => Err(failure()),
			None => Ok(()),
		}
	}

	async fn stall(&self) {
		if self.hang.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}
	}
}

/// Connects to fake servers by host name.
#[derive(Debug, Default)]
pub struct MockConnector {
	servers: Mutex<HashMap<String, Arc<Server>>>,
}

impl MockConnector {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn server(&self, host: &str) -> Arc<Server> {
		self.servers.lock().unwrap().entry(host.to_owned()).or_default().clone()
	}
}

#[async_trait]
impl Connector for MockConnector {
	async fn connect(&self, target: &TransportTarget) -> Result<Arc<dyn Transport>, Error> {
		let server = self.server(&target.host);
		server.connects.fetch_add(1, Ordering::SeqCst);
		Server::next_failure(&server.connect_failures)?;

		if target.encryption != EncryptionMethod::None {
			let chain = server.chain.lock().unwrap().clone();
			if let (Some(verifier), Some(chain)) = (&target.verifier, chain) {
				verifier
					.verify_chain(&chain, SystemTime::now())
					.map_err(|err| Error::Tls(err.to_string()))?;
			}
		}
		Ok(Arc::new(MockTransport { server }))
	}
}

#[derive(Debug)]
struct MockTransport {
	server: Arc<Server>,
}

impl MockTransport {
	async fn write(&self, dn: &str, description: String) -> Result<(), Error> {
		self.server.stall().await;
		Server::next_failure(&self.server.operation_failures)?;
		if let Some(urls) = self.server.write_referrals.lock().unwrap().get(dn) {
			return Err(Error::Referral(urls.clone()));
		}
		self.server.writes.lock().unwrap().push(description);
		Ok(())
	}
}

#[async_trait]
impl Transport for MockTransport {
	async fn bind(&self, request: &BindRequest) -> Result<(), Error> {
		Server::next_failure(&self.server.bind_failures)?;
		self.server.binds.lock().unwrap().push(request.clone());
		Ok(())
	}

	async fn search(&self, request: &SearchRequest) -> Result<Box<dyn EntryStream>, Error> {
		self.server.stall().await;
		Server::next_failure(&self.server.operation_failures)?;
		self.server.searches.lock().unwrap().push(request.clone());
		let results = self.server.results.lock().unwrap();
		let items = results.get(&request.base).cloned().unwrap_or_default();
		Ok(Box::new(MockStream { items: items.into() }))
	}

	async fn add(&self, dn: &str, attributes: &[Attribute]) -> Result<(), Error> {
		self.write(dn, format!("add {dn} ({} attributes)", attributes.len())).await
	}

	async fn modify(&self, dn: &str, changes: &[Modification]) -> Result<(), Error> {
		self.write(dn, format!("modify {dn} ({} changes)", changes.len())).await
	}

	async fn delete(&self, dn: &str) -> Result<(), Error> {
		self.write(dn, format!("delete {dn}")).await
	}

	async fn rename(&self, old_dn: &str, new_dn: &str, _delete_old_rdn: bool) -> Result<(), Error> {
		self.write(old_dn, format!("modrdn {old_dn} -> {new_dn}")).await
	}

	async fn close(&self) {
		self.server.closes.fetch_add(1, Ordering::SeqCst);
	}
}

#[derive(Debug)]
struct MockStream {
	items: VecDeque<StreamItem>,
}

#[async_trait]
impl EntryStream for MockStream {
	async fn next(&mut self) -> Result<Option<StreamItem>, Error> {
		Ok(self.items.pop_front())
	}
}

pub fn entry(dn: &str) -> StreamItem {
	StreamItem::Entry(SearchEntry {
		dn: dn.to_owned(),
		attrs: HashMap::from([("cn".to_owned(), vec![dn.to_owned()])]),
		bin_attrs: HashMap::new(),
	})
}

pub fn referral(urls: &[&str]) -> StreamItem {
	StreamItem::Referral(urls.iter().map(|url| (*url).to_owned()).collect())
}

pub fn params(host: &str) -> ConnectionParameters {
	ConnectionParameters {
		name: host.to_owned(),
		host: host.to_owned(),
		auth: AuthMethod::Simple,
		bind_principal: Some("cn=admin,dc=example,dc=org".to_owned()),
		bind_password: Some("adminpassword".to_owned()),
		..ConnectionParameters::default()
	}
}

/// Hands out queued credentials, then none.
#[derive(Debug, Default)]
pub struct QueuedCredentials {
	queue: Mutex<VecDeque<Credentials>>,
}

impl QueuedCredentials {
	pub fn new(principals: &[&str]) -> Arc<Self> {
		let queue =
			principals.iter().map(|principal| Credentials::new(*principal, "secret")).collect();
		Arc::new(Self { queue: Mutex::new(queue) })
	}
}

impl CredentialsProvider for QueuedCredentials {
	fn credentials(&self, _params: &ConnectionParameters) -> Option<Credentials> {
		self.queue.lock().unwrap().pop_front()
	}
}

/// Keeps one line per logged write.
#[derive(Debug, Default)]
pub struct MemoryLogger {
	pub lines: Mutex<Vec<String>>,
}

impl OperationLogger for MemoryLogger {
	fn log(&self, record: &OperationRecord<'_>) {
		let outcome = match record.outcome {
			Ok(()) => "ok".to_owned(),
			Err(err) => err.to_string(),
		};
		self.lines.lock().unwrap().push(format!(
			"{} {} {} {}",
			record.connection.host,
			record.operation.kind(),
			record.operation.dn(),
			outcome
		));
	}
}

/// Certificate checks with fixed outcomes.
#[derive(Debug, Default)]
pub struct FixedChecks {
	pub expired: bool,
	pub wrong_host: bool,
}

impl CertificateChecks for FixedChecks {
	fn chain_trust(
		&self,
		_: &[Certificate],
		_: &str,
		_: SystemTime,
	) -> Result<(), CertificateError> {
		Ok(())
	}

	fn validity(&self, _: &Certificate, _: SystemTime) -> Result<(), CertificateError> {
		if self.expired {
			Err(CertificateError::Expired)
		} else {
			Ok(())
		}
	}

	fn hostname(&self, _: &Certificate, _: &str) -> Result<(), CertificateError> {
		if self.wrong_host {
			Err(CertificateError::NotValidForName)
		} else {
			Ok(())
		}
	}
}

/// Trust callback answering with a fixed decision, counting calls.
#[derive(Debug)]
pub struct FixedDecision {
	pub decision: TrustDecision,
	pub causes: Mutex<Vec<usize>>,
}

impl FixedDecision {
	pub fn new(decision: TrustDecision) -> Arc<Self> {
		Arc::new(Self { decision, causes: Mutex::new(Vec::new()) })
	}

	pub fn calls(&self) -> Vec<usize> {
		self.causes.lock().unwrap().clone()
	}
}

impl TrustCallback for FixedDecision {
	fn verify(
		&self,
		_host: &str,
		_chain: &[Certificate],
		causes: &[TrustFailureCause],
	) -> TrustDecision {
		self.causes.lock().unwrap().push(causes.len());
		self.decision
	}
}
