//! Fuzz target for collection list parsing and the change-stream filter.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mongo_bisync::config::CollectionScope;
use mongo_bisync::feed::collection_filter_pipeline;

fuzz_target!(|data: (&str, &str)| {
    let (collections, excluded) = data;

    let parsed = CollectionScope::parse_list(collections);
    for (i, name) in parsed.iter().enumerate() {
        assert!(!name.is_empty());
        assert!(!name.contains(','));
        assert!(!parsed[..i].contains(name));
    }

    let scope = CollectionScope::new(parsed).excluding(CollectionScope::parse_list(excluded));
    for name in scope.effective() {
        assert!(scope.contains(&name));
    }
    for name in &scope.excluded {
        assert!(!scope.contains(name));
    }

    let pipeline = collection_filter_pipeline(&scope);
    assert_eq!(pipeline.len(), 1);
});
