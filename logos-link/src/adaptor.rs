//! Document adaptors: the capability a room uses to talk to its CRDT.
//!
//! The client never interprets update bytes itself. It hands inbound
//! payloads to the room's adaptor, asks it for the local version when
//! joining, and asks it whether a server version has been reached.
//!
//! [`YrsDocAdaptor`] is the built-in adaptor for `Yjs` rooms, backed by a
//! `yrs::Doc`.

use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::error::AdaptorError;
use crate::protocol::CrdtType;

/// Capability a room needs from its document.
///
/// Implementations are shared between the application and the connection
/// task, so they must be thread-safe.
pub trait CrdtDocAdaptor: Send + Sync + 'static {
    fn crdt_type(&self) -> CrdtType;

    /// Encoded local version, sent with every join.
    fn version(&self) -> Vec<u8>;

    /// Merge a remote update into the document.
    fn apply_update(&self, update: &[u8]) -> Result<(), AdaptorError>;

    /// Called once the server acknowledged a join. Returns the updates the
    /// server is missing, which are sent before any buffered update.
    fn on_join_ok(&self, server_version: &[u8]) -> Result<Vec<Vec<u8>>, AdaptorError>;

    /// Whether the local document has caught up with `server_version`.
    fn has_reached(&self, server_version: &[u8]) -> bool;

    fn on_join_failed(&self, _reason: &str) {}

    fn on_cleanup(&self) {}
}

/// `Yjs` adaptor over a [`yrs::Doc`].
pub struct YrsDocAdaptor {
    doc: yrs::Doc,
    /// State vector at the last [`take_local_update`](Self::take_local_update).
    sent: Mutex<StateVector>,
}

impl YrsDocAdaptor {
    pub fn new() -> Self {
        Self::with_doc(yrs::Doc::new())
    }

    pub fn with_doc(doc: yrs::Doc) -> Self {
        let sent = doc.transact().state_vector();
        Self {
            doc,
            sent: Mutex::new(sent),
        }
    }

    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    /// Diff of everything changed locally since the previous call, or
    /// `None` when nothing changed.
    pub fn take_local_update(&self) -> Option<Vec<u8>> {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        let txn = self.doc.transact();
        let current = txn.state_vector();
        if current == *sent {
            return None;
        }
        let diff = txn.encode_diff_v1(&sent);
        *sent = current;
        Some(diff)
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for YrsDocAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDocAdaptor for YrsDocAdaptor {
    fn crdt_type(&self) -> CrdtType {
        CrdtType::Yjs
    }

    fn version(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn apply_update(&self, update: &[u8]) -> Result<(), AdaptorError> {
        let update =
            Update::decode_v1(update).map_err(|e| AdaptorError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| AdaptorError::MalformedUpdate(e.to_string()))?;
        Ok(())
    }

    fn on_join_ok(&self, server_version: &[u8]) -> Result<Vec<Vec<u8>>, AdaptorError> {
        let remote = StateVector::decode_v1(server_version)
            .map_err(|e| AdaptorError::MalformedVersion(e.to_string()))?;
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        let txn = self.doc.transact();
        let diff = txn.encode_diff_v1(&remote);
        *sent = txn.state_vector();
        // An empty yrs update encodes to two zero bytes.
        if diff.len() <= 2 {
            return Ok(Vec::new());
        }
        Ok(vec![diff])
    }

    fn has_reached(&self, server_version: &[u8]) -> bool {
        let Ok(remote) = StateVector::decode_v1(server_version) else {
            return false;
        };
        let local = self.doc.transact().state_vector();
        remote
            .iter()
            .all(|(client, clock)| local.get(client) >= *clock)
    }
}
