//! The authoritative CRDT document.
//!
//! A thin wrapper over a `yrs::Doc` pinned to a named shared text type
//! (the default is `"quill"`, matching y-quill clients). Updates and state
//! vectors use the v1 encoding throughout; relayed updates are never
//! re-encoded.
//!
//! All access goes through short-lived transactions scoped inside the
//! method bodies, so a caller can hold the document behind an async lock
//! without ever carrying a transaction across an await.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update, WriteTxn};

/// Errors from applying foreign bytes to the document. On any of these the
/// document is unchanged.
#[derive(Error, Debug)]
pub enum DocError {
    #[error("malformed update: {0}")]
    BadUpdate(yrs::encoding::read::Error),
    #[error("update could not be integrated: {0}")]
    Rejected(yrs::error::UpdateError),
    #[error("malformed state vector: {0}")]
    BadStateVector(yrs::encoding::read::Error),
}

/// The single authoritative document replica held by the relay.
pub struct SharedDoc {
    doc: Doc,
    root: String,
}

impl SharedDoc {
    /// Create a fresh document rooted at the named shared text type.
    pub fn new(shared_type_name: &str) -> Self {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(shared_type_name);
        }
        Self {
            doc,
            root: shared_type_name.to_owned(),
        }
    }

    /// Name of the shared text root.
    pub fn shared_type(&self) -> &str {
        &self.root
    }

    /// Merge an encoded v1 update. Idempotent and commutative by CRDT
    /// construction: re-applying bytes already observed is a no-op.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), DocError> {
        let decoded = Update::decode_v1(update).map_err(DocError::BadUpdate)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded).map_err(DocError::Rejected)?;
        Ok(())
    }

    /// Encode the complete history as one update — what a peer with an
    /// empty state vector needs.
    pub fn state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Compact summary of everything this replica has observed.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal update carrying a peer at `state_vector` to the current
    /// state. Empty bytes mean the peer is already caught up.
    pub fn diff_against(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(state_vector).map_err(DocError::BadStateVector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Best-effort text view of the root, for diagnostics. Empty when the
    /// root holds nothing.
    pub fn text_snapshot(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(self.root.as_str())
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::Text;

    /// A client-side replica that inserted `content` at offset 0.
    fn replica_with_text(content: &str) -> Doc {
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("quill");
        text.insert(&mut txn, 0, content);
        drop(txn);
        doc
    }

    fn full_state(doc: &Doc) -> Vec<u8> {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn test_fresh_doc_is_empty() {
        let doc = SharedDoc::new("quill");
        assert_eq!(doc.text_snapshot(), "");
        assert_eq!(doc.shared_type(), "quill");
    }

    #[test]
    fn test_apply_update_merges_text() {
        let remote = replica_with_text("hello");
        let mut doc = SharedDoc::new("quill");
        doc.apply_update(&full_state(&remote)).unwrap();
        assert_eq!(doc.text_snapshot(), "hello");
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let remote = replica_with_text("hello");
        let update = full_state(&remote);

        let mut doc = SharedDoc::new("quill");
        doc.apply_update(&update).unwrap();
        doc.apply_update(&update).unwrap();
        assert_eq!(doc.text_snapshot(), "hello");
    }

    #[test]
    fn test_apply_update_is_commutative() {
        let a = replica_with_text("X");
        let b = replica_with_text("Y");
        let (update_a, update_b) = (full_state(&a), full_state(&b));

        let mut ab = SharedDoc::new("quill");
        ab.apply_update(&update_a).unwrap();
        ab.apply_update(&update_b).unwrap();

        let mut ba = SharedDoc::new("quill");
        ba.apply_update(&update_b).unwrap();
        ba.apply_update(&update_a).unwrap();

        // Same converged text either way, containing exactly X and Y.
        assert_eq!(ab.text_snapshot(), ba.text_snapshot());
        let merged = ab.text_snapshot();
        assert_eq!(merged.len(), 2);
        assert!(merged.contains('X') && merged.contains('Y'));
    }

    #[test]
    fn test_apply_garbage_leaves_doc_unchanged() {
        let remote = replica_with_text("hello");
        let mut doc = SharedDoc::new("quill");
        doc.apply_update(&full_state(&remote)).unwrap();

        let err = doc.apply_update(&[0xFF, 0xFE, 0xFD, 0xFC]);
        assert!(matches!(err, Err(DocError::BadUpdate(_))));
        assert_eq!(doc.text_snapshot(), "hello");
    }

    #[test]
    fn test_state_as_update_rebuilds_replica() {
        let remote = replica_with_text("persistent");
        let mut doc = SharedDoc::new("quill");
        doc.apply_update(&full_state(&remote)).unwrap();

        let mut rebuilt = SharedDoc::new("quill");
        rebuilt.apply_update(&doc.state_as_update()).unwrap();
        assert_eq!(rebuilt.text_snapshot(), "persistent");
    }

    #[test]
    fn test_diff_against_empty_state_vector_is_full_state() {
        let remote = replica_with_text("abc");
        let mut doc = SharedDoc::new("quill");
        doc.apply_update(&full_state(&remote)).unwrap();

        let empty_sv = StateVector::default().encode_v1();
        let diff = doc.diff_against(&empty_sv).unwrap();

        let mut fresh = SharedDoc::new("quill");
        fresh.apply_update(&diff).unwrap();
        assert_eq!(fresh.text_snapshot(), "abc");
    }

    #[test]
    fn test_diff_against_caught_up_peer_carries_nothing() {
        let remote = replica_with_text("abc");
        let mut doc = SharedDoc::new("quill");
        doc.apply_update(&full_state(&remote)).unwrap();

        let diff = doc.diff_against(&doc.state_vector()).unwrap();

        // Applying the diff to an up-to-date replica changes nothing.
        let before = doc.text_snapshot();
        doc.apply_update(&diff).unwrap();
        assert_eq!(doc.text_snapshot(), before);
    }

    #[test]
    fn test_diff_against_malformed_state_vector() {
        let doc = SharedDoc::new("quill");
        let err = doc.diff_against(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(err, Err(DocError::BadStateVector(_))));
    }

    #[test]
    fn test_incremental_edit_diff() {
        // A replica edits twice; the diff from the first observation
        // carries only the second edit.
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("quill");
        text.insert(&mut txn, 0, "hello");
        drop(txn);

        let after_first = full_state(&doc);
        let sv_after_first = {
            let txn = doc.transact();
            txn.state_vector().encode_v1()
        };

        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("quill");
        text.insert(&mut txn, 5, " world");
        drop(txn);

        let mut server = SharedDoc::new("quill");
        server.apply_update(&full_state(&doc)).unwrap();
        assert_eq!(server.text_snapshot(), "hello world");

        let tail = server.diff_against(&sv_after_first).unwrap();
        assert!(!tail.is_empty());
        assert!(tail.len() < server.state_as_update().len());

        // A replica that already saw "hello" converges from the tail alone.
        let mut catching_up = SharedDoc::new("quill");
        catching_up.apply_update(&after_first).unwrap();
        assert_eq!(catching_up.text_snapshot(), "hello");
        catching_up.apply_update(&tail).unwrap();
        assert_eq!(catching_up.text_snapshot(), "hello world");
    }
}
