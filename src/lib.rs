//! Sessions against LDAP directory servers.
//!
//! A [`ConnectionSession`] owns one logical connection: it opens the
//! transport (plain, LDAPS or StartTLS), binds with credentials from a
//! [`CredentialsProvider`], and runs searches and write operations. Every
//! operation runs under a [`ProgressMonitor`] through which it can be
//! cancelled, and is retried once after reconnecting if the connection
//! breaks down underneath it.
//!
//! Referrals are handled per operation as [`ReferralHandling`] says. When
//! followed, the servers they point to are reached through a
//! [`ReferralResolver`], by default a [`ReferralConnections`] cache, and a
//! shared [`ReferralsInfo`] detects loops. Search results stream lazily
//! through a [`ResultStream`], each tagged with the connection it came from.
//!
//! Server certificates are checked by a [`TrustDecisionInterceptor`] that
//! asks a [`TrustCallback`] about certificates failing verification and
//! remembers accepted ones in [`TrustStores`].
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate,
//! which is used here for interfacing with LDAP, is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use ldap_session::{
//!     config::{AuthMethod, ConnectionParameters},
//!     credentials::StaticCredentials,
//!     ldap::LdapConnector,
//!     monitor::ProgressMonitor,
//!     referral::ReferralHandling,
//!     session::{Collaborators, ConnectionSession},
//!     transport::SearchRequest,
//! };
//!
//! // Parameters can also be deserialized with serde. They're hand-constructed
//! // here for demonstration purposes.
//! let params = ConnectionParameters {
//!     host: "localhost".to_owned(),
//!     port: 1389,
//!     auth: AuthMethod::Simple,
//!     bind_principal: Some("cn=admin,dc=example,dc=org".to_owned()),
//!     bind_password: Some("adminpassword".to_owned()),
//!     ..ConnectionParameters::default()
//! };
//! let collaborators = Collaborators {
//!     credentials: Some(Arc::new(StaticCredentials)),
//!     ..Collaborators::default()
//! };
//!
//! let mut session = ConnectionSession::new(params, Arc::new(LdapConnector), collaborators);
//! let monitor = ProgressMonitor::new();
//! let mut results = session
//!     .search(
//!         SearchRequest::new("dc=example,dc=org", "(objectClass=inetOrgPerson)"),
//!         ReferralHandling::Follow,
//!         &monitor,
//!         None,
//!     )
//!     .await?;
//! while let Some(result) = results.next().await? {
//!     println!("{} from {}", result.dn(), result.connection().display_name());
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * SASL DIGEST-MD5 and CRAM-MD5 are not supported by the `ldap3` transport;
//!   GSSAPI needs the `gssapi` feature.
//! * A write operation that fails transiently is retried once even if the
//!   server may already have applied it.

pub mod cache;
pub mod config;
pub mod credentials;
pub mod entry;
pub mod error;
pub mod ldap;
pub mod monitor;
pub mod oplog;
pub mod referral;
pub mod session;
pub mod stream;
pub mod transport;
pub mod trust;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	cache::{ReferralConnections, ReferralResolver},
	config::{AuthMethod, ConnectionParameters, EncryptionMethod},
	credentials::{Credentials, CredentialsProvider},
	entry::{SearchEntryExt, SearchResult},
	error::Error,
	monitor::ProgressMonitor,
	oplog::{OperationLogger, OperationRecord, WriteOperation},
	referral::{ReferralHandling, ReferralUrl, ReferralsInfo},
	session::{Collaborators, ConnectionSession, SessionState, SharedSession},
	stream::ResultStream,
	transport::{Attribute, Modification, SearchRequest, SearchScope},
	trust::{TrustCallback, TrustDecision, TrustDecisionInterceptor, TrustFailureCause, TrustStores},
};
