//! Property-based test generators using proptest, and workload operations
//! replayed against [`TestClient`]s.

use proptest::prelude::*;
use synclane_engine::LocalPersistence;
use synclane_protocol::{Bound, IndexKey, KeyRange};
use synclane_value::Value;

use crate::fixtures::{conversation_args, create_conversation, message_args, send_message};
use crate::harness::{HarnessResult, TestClient};

/// One step of a simulated client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    /// Submit `conversations:create`.
    CreateConversation {
        /// User-visible conversation id.
        id: String,
        /// Emoji field.
        emoji: String,
    },
    /// Submit `messages:send`.
    SendMessage {
        /// Target conversation id.
        conversation: String,
        /// Message body.
        body: String,
    },
    /// Exchange messages with the server until quiescent.
    Pump,
    /// Drop the connection and open a new one.
    Reconnect,
    /// Drop the connection.
    Disconnect,
}

impl ClientOp {
    /// Applies the operation to a client.
    pub fn apply<P: LocalPersistence>(&self, client: &mut TestClient<P>) -> HarnessResult<()> {
        match self {
            ClientOp::CreateConversation { id, emoji } => {
                let args = conversation_args(id, emoji);
                client
                    .engine
                    .submit_mutation(&create_conversation(), args.clone(), args);
            }
            ClientOp::SendMessage { conversation, body } => {
                let args = message_args(conversation, body);
                client
                    .engine
                    .submit_mutation(&send_message(), args.clone(), args);
            }
            ClientOp::Pump => {
                client.connect();
                client.pump()?;
            }
            ClientOp::Reconnect => client.reconnect(),
            ClientOp::Disconnect => client.disconnect(),
        }
        Ok(())
    }
}

/// Strategy for short conversation ids. A small alphabet makes duplicate
/// creates, and therefore server rejections, likely.
pub fn conversation_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e", ""]).prop_map(str::to_string)
}

/// Strategy for one client operation.
pub fn client_op_strategy() -> impl Strategy<Value = ClientOp> {
    prop_oneof![
        4 => (conversation_id_strategy(), "[a-z]{1,3}")
            .prop_map(|(id, emoji)| ClientOp::CreateConversation { id, emoji }),
        3 => (conversation_id_strategy(), "[a-z ]{0,8}")
            .prop_map(|(conversation, body)| ClientOp::SendMessage { conversation, body }),
        3 => Just(ClientOp::Pump),
        1 => Just(ClientOp::Reconnect),
        1 => Just(ClientOp::Disconnect),
    ]
}

/// Strategy for a workload of `len` operations.
pub fn workload_strategy(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<ClientOp>> {
    prop::collection::vec(client_op_strategy(), len)
}

/// Strategy for a bound over single-integer keys in `0..10`.
pub fn int_bound_strategy() -> impl Strategy<Value = Bound> {
    prop_oneof![
        Just(Bound::Minimal),
        Just(Bound::Maximal),
        (0i64..10).prop_map(|k| Bound::Exact(int_key(k))),
        (0i64..10).prop_map(|k| Bound::Successor(int_key(k))),
        (0i64..10).prop_map(|k| Bound::Predecessor(int_key(k))),
    ]
}

/// Strategy for non-empty ranges over single-integer keys.
pub fn int_range_strategy() -> impl Strategy<Value = KeyRange> {
    (int_bound_strategy(), int_bound_strategy())
        .prop_filter_map("range must not be empty", |(a, b)| {
            let range = if a <= b {
                KeyRange::new(a, b)
            } else {
                KeyRange::new(b, a)
            };
            (!range.is_empty()).then_some(range)
        })
}

/// A one-element index key.
pub fn int_key(k: i64) -> IndexKey {
    IndexKey(vec![Value::Integer(k)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn ranges_are_non_empty() {
        let mut runner = TestRunner::default();
        for _ in 0..64 {
            let range = int_range_strategy()
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert!(!range.is_empty());
            assert!(range.lower < range.upper);
        }
    }

    #[test]
    fn workloads_have_requested_length() {
        let mut runner = TestRunner::default();
        let ops = workload_strategy(5..6).new_tree(&mut runner).unwrap().current();
        assert_eq!(ops.len(), 5);
    }
}
