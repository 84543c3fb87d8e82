//! Property tests: page cache shape and convergence of random workloads.

use std::collections::BTreeMap;

use proptest::prelude::*;
use synclane_engine::{PageCache, SyncQueryResult};
use synclane_protocol::{
    Direction, Document, DocumentId, KeyRange, PageDocument, PageResult,
};
use synclane_testkit::prelude::*;
use synclane_value::Value;

fn universe(range: &KeyRange) -> Vec<PageDocument> {
    (0i64..10)
        .map(int_key)
        .filter(|key| range.contains(key))
        .map(|key| {
            let id = format!("t:{:?}", key.0);
            PageDocument {
                key,
                document: Document::new(DocumentId::new(id), 0, BTreeMap::new()),
            }
        })
        .collect()
}

fn slice(range: &KeyRange) -> PageResult {
    PageResult {
        documents: universe(range),
        lower: range.lower.clone(),
        upper: range.upper.clone(),
    }
}

proptest! {
    /// Loading requested ranges, and re-delivering arbitrary slices for
    /// existing pages, never leaves overlapping loaded pages; a range that
    /// was just loaded needs no further fetch.
    #[test]
    fn loaded_pages_never_overlap(
        steps in prop::collection::vec((int_range_strategy(), int_range_strategy(), any::<bool>()), 1..16)
    ) {
        let mut cache = PageCache::new();
        for (requested, redelivered, redeliver) in steps {
            let coverage = cache.ensure_range("t", "by_k", &requested, Direction::Asc, None);
            for fetch in coverage.fetches {
                let range = fetch.request.range();
                cache.apply_loaded(fetch.query_id, slice(&range));
            }
            prop_assert!(cache.check_invariants().is_ok(), "{:?}", cache.check_invariants());
            prop_assert!(cache
                .ensure_range("t", "by_k", &requested, Direction::Asc, None)
                .fetches
                .is_empty());

            if redeliver {
                if let Some(id) = cache.iter().map(|p| p.id).last() {
                    cache.apply_loaded(id, slice(&redelivered));
                    prop_assert!(cache.check_invariants().is_ok(), "{:?}", cache.check_invariants());
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever the interleaving of mutations, pumps and reconnects, once
    /// the network settles every client's view equals the server's state,
    /// and a fresh client derives the same value from scratch.
    #[test]
    fn clients_converge_to_the_server(
        first in workload_strategy(1..20),
        second in workload_strategy(1..20),
    ) {
        let server = chat_server();
        let mut clients = [TestClient::new(server.clone()), TestClient::new(server.clone())];
        let subs: Vec<_> = clients
            .iter_mut()
            .map(|c| c.engine.watch(&get_conversations(), Value::Null))
            .collect();
        let on_a: Vec<_> = clients
            .iter_mut()
            .map(|c| c.engine.watch(
                &get_messages(),
                Value::object([("conversation", Value::from("a"))]),
            ))
            .collect();

        let longest = first.len().max(second.len());
        for i in 0..longest {
            for (client, ops) in clients.iter_mut().zip([&first, &second]) {
                if let Some(op) = ops.get(i) {
                    op.apply(client).unwrap();
                }
            }
        }
        for _ in 0..2 {
            for client in clients.iter_mut() {
                client.connect();
                client.pump().unwrap();
            }
        }

        let expected = expected_conversations(&server).unwrap();
        let expected_a = expected_messages(&server, "a").unwrap();
        for ((client, sub), sub_a) in clients.iter().zip(&subs).zip(&on_a) {
            prop_assert_eq!(client.engine.pending_mutations(), 0);
            prop_assert_eq!(
                client.engine.sync_query_result(*sub),
                Some(&SyncQueryResult::Success(expected.clone()))
            );
            prop_assert_eq!(
                client.engine.sync_query_result(*sub_a),
                Some(&SyncQueryResult::Success(expected_a.clone()))
            );
            prop_assert!(client.engine.check_invariants().is_ok());
        }

        let mut fresh = TestClient::new(server.clone());
        fresh.connect();
        let sub = fresh.engine.watch(&get_conversations(), Value::Null);
        fresh.pump().unwrap();
        prop_assert_eq!(
            fresh.engine.sync_query_result(sub),
            Some(&SyncQueryResult::Success(expected))
        );
    }
}
