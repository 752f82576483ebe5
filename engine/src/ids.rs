//! Deterministic identifiers.
//!
//! Ids are UUIDv5 values derived from the document id plus the element's
//! structural position, so re-running the engine on identical input yields
//! identical ids and the persistence adapter can upsert by id.

use uuid::Uuid;

/// Id for a document, derived from its raw text.
pub fn document_id(raw_text: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, raw_text.as_bytes()).to_string()
}

/// Id for an element of `kind` at structural position `key` within a document.
pub fn derive_id(document_id: &str, kind: &str, key: &str) -> String {
    let name = format!("{document_id}/{kind}/{key}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ids_are_stable() {
        let doc = document_id("Chapter 1: Eligibility");
        assert_eq!(doc, document_id("Chapter 1: Eligibility"));
        assert_eq!(derive_id(&doc, "node", "3"), derive_id(&doc, "node", "3"));
        assert_ne!(derive_id(&doc, "node", "3"), derive_id(&doc, "chunk", "3"));
    }
}
