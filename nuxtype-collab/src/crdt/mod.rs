//! CRDT capability used by collaboration sessions.
//!
//! A session never looks inside its document: it only needs to encode the
//! full state, summarise it as a state vector, compute a diff against a
//! remote vector, and merge incoming updates. [`CrdtDocument`] captures that
//! surface; [`YrsDocument`] backs it with `yrs` using v1 encodings, which is
//! what Y.js clients speak on the wire. Every incoming encoding passes a
//! bounds-checked walk before `yrs` decodes it.

mod validate;

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact};

/// An update or state vector the CRDT engine refused to accept.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}

/// Mergeable document state owned by a single session.
pub trait CrdtDocument: Send + Sync + 'static {
    /// A document with no content.
    fn empty() -> Self
    where
        Self: Sized;

    /// Full state encoded as a single update.
    fn encode(&self) -> Vec<u8>;

    /// Compact summary of the updates this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Updates the holder of `state_vector` is missing.
    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError>;

    /// Merge an update produced by any replica.
    fn apply_update(&mut self, update: &[u8]) -> Result<(), MergeError>;
}

/// [`CrdtDocument`] backed by a `yrs::Doc`.
pub struct YrsDocument {
    doc: yrs::Doc,
}

impl YrsDocument {
    /// Borrow the underlying doc, e.g. to read shared types in tests.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl CrdtDocument for YrsDocument {
    fn empty() -> Self {
        Self {
            doc: yrs::Doc::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        validate::state_vector(state_vector)
            .map_err(|e| MergeError::MalformedStateVector(e.to_string()))?;
        let remote = yrs::StateVector::decode_v1(state_vector)
            .map_err(|e| MergeError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<(), MergeError> {
        validate::update(update).map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
        let update =
            yrs::Update::decode_v1(update).map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Rejected(e.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{content, insert};
    use super::*;
    use yrs::{Array, Map, Text, WriteTxn};

    #[test]
    fn test_empty_document_roundtrip() {
        let doc = YrsDocument::empty();
        let mut copy = YrsDocument::empty();
        copy.apply_update(&doc.encode()).unwrap();
        assert_eq!(content(&copy), "");
    }

    #[test]
    fn test_apply_and_encode() {
        let author = yrs::Doc::new();
        let update = insert(&author, 0, "hello");

        let mut doc = YrsDocument::empty();
        doc.apply_update(&update).unwrap();
        assert_eq!(content(&doc), "hello");

        let mut replica = YrsDocument::empty();
        replica.apply_update(&doc.encode()).unwrap();
        assert_eq!(content(&replica), "hello");
    }

    #[test]
    fn test_diff_since_is_smaller_than_full_state() {
        let author = yrs::Doc::new();
        let first = insert(&author, 0, &"x".repeat(2048));

        let mut server = YrsDocument::empty();
        server.apply_update(&first).unwrap();

        let mut client = YrsDocument::empty();
        client.apply_update(&server.encode()).unwrap();
        let stale_vector = client.state_vector();

        let second = insert(&author, 2048, "!");
        server.apply_update(&second).unwrap();

        let diff = server.diff_since(&stale_vector).unwrap();
        assert!(diff.len() < server.encode().len());

        client.apply_update(&diff).unwrap();
        assert_eq!(content(&client), content(&server));
    }

    /// One item by client 0 at clock 0 under the root text "content",
    /// followed by an empty delete set.
    fn root_item(info: u8, content: &[u8]) -> Vec<u8> {
        let mut update = vec![1, 1, 0, 0, info, 1, 7];
        update.extend_from_slice(b"content");
        update.extend_from_slice(content);
        update.push(0);
        update
    }

    #[test]
    fn test_handcrafted_string_item_applies() {
        let mut doc = YrsDocument::empty();
        doc.apply_update(&root_item(4, &[2, b'h', b'i'])).unwrap();
        assert_eq!(content(&doc), "hi");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let mut doc = YrsDocument::empty();
        let err = doc.apply_update(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, MergeError::MalformedUpdate(_)));
    }

    #[test]
    fn test_well_framed_bad_content_rejected() {
        let valid = insert(&yrs::Doc::new(), 0, "hello");

        let mut deep = vec![1];
        for _ in 0..200 {
            deep.extend_from_slice(&[117, 1]);
        }
        deep.push(126);

        let mut long_varint = vec![1, 125];
        long_varint.extend_from_slice(&[0xFF; 10]);
        long_varint.push(0x01);

        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("invalid utf-8 in text", root_item(4, &[2, 0xC3, 0x28])),
            (
                "invalid utf-8 in root name",
                vec![1, 1, 0, 0, 4, 1, 2, 0xFF, 0xFE, 1, b'x', 0],
            ),
            ("truncated update", valid[..valid.len() - 3].to_vec()),
            ("string longer than buffer", root_item(4, &[40, b'a', b'b'])),
            ("unknown content tag", root_item(12, &[])),
            ("unknown shared type", root_item(7, &[42])),
            (
                "huge map length",
                root_item(8, &[1, 118, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
            ),
            ("values nested too deeply", root_item(8, &deep)),
            ("signed varint overflow", root_item(8, &long_varint)),
            (
                "block clock overflow",
                vec![1, 1, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 0, 5, 0],
            ),
            (
                "deleted range overflow",
                vec![0, 1, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 2],
            ),
            (
                "fuzzed frame",
                vec![
                    117, 215, 64, 126, 2, 180, 91, 13, 17, 107, 77, 205, 52, 94, 180, 47, 217,
                    132, 51, 215, 140, 151, 248, 255, 224, 197, 30,
                ],
            ),
        ];

        for (name, bytes) in cases {
            let mut doc = YrsDocument::empty();
            doc.apply_update(&valid).unwrap();
            match doc.apply_update(&bytes) {
                Err(MergeError::MalformedUpdate(_)) => {}
                other => panic!("{name}: expected MalformedUpdate, got {other:?}"),
            }
            assert_eq!(content(&doc), "hello", "{name}: document changed");
        }
    }

    #[test]
    fn test_varied_content_passes_validation() {
        let author = yrs::Doc::new();
        {
            let mut txn = author.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "hello 👋 wörld");
            text.remove_range(&mut txn, 0, 2);
            let meta = txn.get_or_insert_map("meta");
            meta.insert(&mut txn, "title", "Notes");
            meta.insert(&mut txn, "pinned", true);
            meta.insert(&mut txn, "views", 42);
            meta.insert(&mut txn, "ratio", 0.5);
            meta.insert(
                &mut txn,
                "layout",
                yrs::any!({ "columns": [1, 2.5, null], "theme": { "dark": false } }),
            );
            let tags = txn.get_or_insert_array("tags");
            tags.push_back(&mut txn, "draft");
            tags.push_back(&mut txn, -7);
        }
        let full = author
            .transact()
            .encode_state_as_update_v1(&yrs::StateVector::default());

        let mut doc = YrsDocument::empty();
        doc.apply_update(&full).unwrap();
        assert_eq!(content(&doc), "llo 👋 wörld");
        assert!(doc.diff_since(&doc.state_vector()).is_ok());
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        let doc = YrsDocument::empty();
        for bytes in [
            vec![0xFF, 0xFF, 0xFF],
            // claims four billion entries
            vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F],
            vec![1, 0x80],
        ] {
            let err = doc.diff_since(&bytes).unwrap_err();
            assert!(matches!(err, MergeError::MalformedStateVector(_)));
        }
    }

    #[test]
    fn test_convergence_independent_of_order() {
        let alice = yrs::Doc::new();
        let bob = yrs::Doc::new();
        let a = insert(&alice, 0, "alpha");
        let b = insert(&bob, 0, "beta");

        let mut left = YrsDocument::empty();
        left.apply_update(&a).unwrap();
        left.apply_update(&b).unwrap();

        let mut right = YrsDocument::empty();
        right.apply_update(&b).unwrap();
        right.apply_update(&a).unwrap();

        assert_eq!(content(&left), content(&right));
        let left_sv = yrs::StateVector::decode_v1(&left.state_vector()).unwrap();
        let right_sv = yrs::StateVector::decode_v1(&right.state_vector()).unwrap();
        assert_eq!(left_sv, right_sv);
    }
}
