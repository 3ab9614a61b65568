//! Audit trail of write operations.
use std::fmt;

use tracing::{info, warn};

use crate::{
	config::ConnectionParameters,
	error::Error,
	transport::{Attribute, Modification},
};

/// A write operation with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOperation {
	/// Create an entry.
	Add {
		/// DN of the new entry
		dn: String,
		/// Its attributes
		attributes: Vec<Attribute>,
	},
	/// Change attributes of an entry.
	Modify {
		/// DN of the entry
		dn: String,
		/// The changes
		changes: Vec<Modification>,
	},
	/// Remove an entry.
	Delete {
		/// DN of the entry
		dn: String,
	},
	/// Rename or move an entry.
	Rename {
		/// Current DN
		old_dn: String,
		/// New DN
		new_dn: String,
		/// Whether the old RDN values are removed from the entry
		delete_old_rdn: bool,
	},
}

/// Kind of a write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
	/// add
	Add,
	/// modify
	Modify,
	/// delete
	Delete,
	/// modrdn
	Rename,
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			OperationKind::Add => "add",
			OperationKind::Modify => "modify",
			OperationKind::Delete => "delete",
			OperationKind::Rename => "modrdn",
		})
	}
}

impl WriteOperation {
	/// Kind of the operation.
	#[must_use]
	pub fn kind(&self) -> OperationKind {
		match self {
			WriteOperation::Add { .. } => OperationKind::Add,
			WriteOperation::Modify { .. } => OperationKind::Modify,
			WriteOperation::Delete { .. } => OperationKind::Delete,
			WriteOperation::Rename { .. } => OperationKind::Rename,
		}
	}

	/// DN of the target entry.
	#[must_use]
	pub fn dn(&self) -> &str {
		match self {
			WriteOperation::Add { dn, .. }
			| WriteOperation::Modify { dn, .. }
			| WriteOperation::Delete { dn } => dn,
			WriteOperation::Rename { old_dn, .. } => old_dn,
		}
	}

	/// The same operation against another target DN. Renames keep their
	/// DNs, as a referral does not say where the new name would go.
	#[must_use]
	pub fn retarget(&self, target: &str) -> Self {
		let mut operation = self.clone();
		match &mut operation {
			WriteOperation::Add { dn, .. }
			| WriteOperation::Modify { dn, .. }
			| WriteOperation::Delete { dn } => target.clone_into(dn),
			WriteOperation::Rename { .. } => {}
		}
		operation
	}
}

/// A completed write operation as handed to an [`OperationLogger`].
#[derive(Debug)]
pub struct OperationRecord<'a> {
	/// Connection the operation ran on.
	pub connection: &'a ConnectionParameters,
	/// The operation and its payload.
	pub operation: &'a WriteOperation,
	/// How it ended.
	pub outcome: Result<(), &'a Error>,
}

/// Receives every completed write operation, for display in an audit
/// trail. Never consulted for control flow.
pub trait OperationLogger: Send + Sync {
	/// Record one operation.
	fn log(&self, record: &OperationRecord<'_>);
}

/// Writes the audit trail to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl OperationLogger for TracingLogger {
	fn log(&self, record: &OperationRecord<'_>) {
		let connection = record.connection.display_name();
		let kind = record.operation.kind();
		let dn = record.operation.dn();
		match record.outcome {
			Ok(()) => info!(%connection, %kind, dn, "Directory updated"),
			Err(err) => warn!(%connection, %kind, dn, "Directory update failed: {err}"),
		}
	}
}
