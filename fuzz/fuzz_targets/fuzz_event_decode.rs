//! Fuzz target for decoding arbitrary BSON into change events.
//!
//! Hashing and keying must never panic, whatever the server sends.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mongo_bisync::feed::{fingerprint, id_key, ChangeEvent, OperationType};
use mongo_bisync::origin::Fingerprint;
use mongodb::bson::{self, Document};

fuzz_target!(|data: (&str, &[u8])| {
    let (op, bytes) = data;

    let operation = match OperationType::parse(op) {
        Some(parsed) => {
            assert_eq!(OperationType::parse(parsed.as_str()), Some(parsed));
            parsed
        }
        None => OperationType::Insert,
    };

    let Ok(document) = bson::from_slice::<Document>(bytes) else {
        return;
    };

    let digest = fingerprint(&document);
    assert_eq!(digest.len(), 64);
    assert_eq!(digest, fingerprint(&document.clone()));

    let Some(id) = document.get("_id").cloned() else {
        return;
    };
    let key = id_key(&id);
    assert_eq!(key, id_key(&id));

    let full = (!matches!(operation, OperationType::Delete)).then(|| document.clone());
    let event = ChangeEvent::new(operation, "fuzz".to_string(), id, full);
    assert_eq!(event.id_key(), key);
    match Fingerprint::of_event(&event) {
        Some(Fingerprint::Deleted) => assert!(event.is_delete()),
        Some(Fingerprint::Content(_)) => assert!(!event.is_delete()),
        None => unreachable!("events carry a post-image unless deleted"),
    }
});
