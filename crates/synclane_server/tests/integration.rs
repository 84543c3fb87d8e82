//! End-to-end tests of the sync server over its message interface.

use std::collections::BTreeMap;
use std::sync::Arc;

use synclane_protocol::{
    Bound, ClientMessage, Direction, Document, IndexDefinition, IndexKey, KeyRange, MutationId,
    MutationOutcome, PageQuery, PageRequest, QueryId, QuerySetModification, ServerMessage,
    SessionId, StateModification, Transition, Version,
};
use synclane_server::{
    Access, ConnectionId, Identity, MemoryTable, ServerConfig, SyncServer,
};
use synclane_value::Value;

fn messages_server() -> SyncServer {
    let server = SyncServer::new(ServerConfig::default().with_index_batch_size(2));
    let table = MemoryTable::new(
        "messages",
        vec![IndexDefinition::new("by_conversation", vec!["conversation".into()])],
    )
    .with_policy(Arc::new(|doc: &Document, identity: &Identity| {
        match (doc.get("private"), identity) {
            (Value::Bool(true), Identity::Anonymous) => Access::Hide,
            (Value::Text(owner), Identity::User(user)) if owner != *user => Access::Deny,
            _ => Access::Allow,
        }
    }));
    server.add_table(table);
    server.register_mutation("messages:send", |w, args, _| {
        let conversation = args
            .get("conversation")
            .cloned()
            .ok_or_else(|| "missing conversation".to_string())?;
        let mut fields = BTreeMap::new();
        fields.insert("conversation".to_string(), conversation);
        fields.insert(
            "body".to_string(),
            args.get("body").cloned().unwrap_or(Value::Null),
        );
        if let Some(private) = args.get("private") {
            fields.insert("private".to_string(), private.clone());
        }
        let id = w.insert("messages", fields).map_err(|e| e.to_string())?;
        Ok(Value::from(id.as_str()))
    });
    server
}

fn open(server: &SyncServer, session: SessionId, identity: Identity) -> ConnectionId {
    let conn = server.connect(identity);
    let replies = server
        .handle_message(
            conn,
            ClientMessage::Connect {
                session_id: session,
                max_observed_version: Version::ZERO,
            },
        )
        .unwrap();
    assert!(replies.is_empty());
    conn
}

fn send(server: &SyncServer, conn: ConnectionId, id: u64, conversation: &str, body: &str) {
    let replies = server
        .handle_message(
            conn,
            ClientMessage::Mutation {
                mutation_id: MutationId(id),
                name: "messages:send".into(),
                args: Value::object([
                    ("conversation", Value::from(conversation)),
                    ("body", Value::from(body)),
                ]),
            },
        )
        .unwrap();
    assert!(matches!(
        replies[0],
        ServerMessage::MutationResponse {
            outcome: MutationOutcome::Success { .. },
            ..
        }
    ));
}

fn subscribe(
    server: &SyncServer,
    conn: ConnectionId,
    base: u32,
    query_id: u64,
    request: PageRequest,
) -> Transition {
    let replies = server
        .handle_message(
            conn,
            ClientMessage::ModifyQuerySet {
                base_version: base,
                new_version: base + 1,
                modifications: vec![QuerySetModification::Add(PageQuery {
                    query_id: QueryId(query_id),
                    request,
                })],
            },
        )
        .unwrap();
    match replies.into_iter().next() {
        Some(ServerMessage::Transition(t)) => t,
        other => panic!("expected transition, got {other:?}"),
    }
}

fn page_bodies(transition: &Transition) -> Vec<Value> {
    match &transition.modifications[0] {
        StateModification::QueryUpdated { page, .. } => page
            .documents
            .iter()
            .map(|d| d.document.get("body"))
            .collect(),
        other => panic!("expected update, got {other:?}"),
    }
}

#[test]
fn paginated_group_scan_resumes_at_boundary() {
    let server = messages_server();
    let conn = open(&server, SessionId::generate(), Identity::Anonymous);
    for (i, (conversation, body)) in [("c1", "a"), ("c2", "b"), ("c1", "c"), ("c1", "d")]
        .into_iter()
        .enumerate()
    {
        send(&server, conn, i as u64, conversation, body);
    }

    let c1 = KeyRange::prefix(IndexKey(vec![Value::from("c1")]));
    let first = subscribe(
        &server,
        conn,
        0,
        1,
        PageRequest::new("messages", "by_conversation", c1.clone()).with_limit(2),
    );
    assert_eq!(page_bodies(&first), [Value::from("a"), Value::from("c")]);
    let StateModification::QueryUpdated { page, .. } = &first.modifications[0] else {
        unreachable!()
    };
    assert!(matches!(page.upper, Bound::Successor(_)));

    let rest = subscribe(
        &server,
        conn,
        1,
        2,
        PageRequest::new(
            "messages",
            "by_conversation",
            KeyRange::new(page.upper.clone(), c1.upper.clone()),
        ),
    );
    assert_eq!(page_bodies(&rest), [Value::from("d")]);
}

#[test]
fn descending_page_tracks_new_documents() {
    let server = messages_server();
    let writer = open(&server, SessionId::generate(), Identity::Anonymous);
    let reader = open(&server, SessionId::generate(), Identity::Anonymous);
    send(&server, writer, 1, "c1", "old");

    let initial = subscribe(
        &server,
        reader,
        0,
        1,
        PageRequest::new("messages", "by_creation_time", KeyRange::all())
            .with_direction(Direction::Desc)
            .with_limit(10),
    );
    assert_eq!(page_bodies(&initial), [Value::from("old")]);

    send(&server, writer, 2, "c1", "new");
    let Some(ServerMessage::Transition(t)) = server.poll_transition(reader).unwrap() else {
        panic!("expected transition");
    };
    assert_eq!(t.start_version, initial.end_version);
    assert_eq!(page_bodies(&t), [Value::from("old"), Value::from("new")]);
}

#[test]
fn hidden_and_denied_documents() {
    let server = messages_server();
    let conn = open(&server, SessionId::generate(), Identity::Anonymous);
    let replies = server
        .handle_message(
            conn,
            ClientMessage::Mutation {
                mutation_id: MutationId(1),
                name: "messages:send".into(),
                args: Value::object([
                    ("conversation", Value::from("c1")),
                    ("body", Value::from("secret")),
                    ("private", Value::Bool(true)),
                ]),
            },
        )
        .unwrap();
    assert_eq!(replies.len(), 2);
    send(&server, conn, 2, "c1", "public");

    let anon = subscribe(
        &server,
        conn,
        0,
        1,
        PageRequest::new("messages", "by_id", KeyRange::all()),
    );
    assert_eq!(page_bodies(&anon), [Value::from("public")]);

    server
        .write(|w| {
            let mut fields = BTreeMap::new();
            fields.insert("private".to_string(), Value::from("alice"));
            w.insert("messages", fields)?;
            Ok(())
        })
        .unwrap();
    let bob = open(&server, SessionId::generate(), Identity::User("bob".into()));
    let t = subscribe(
        &server,
        bob,
        0,
        1,
        PageRequest::new("messages", "by_id", KeyRange::all()),
    );
    assert!(matches!(
        t.modifications[0],
        StateModification::QueryFailed { .. }
    ));
}

#[test]
fn resent_mutation_after_reconnect_is_deduplicated() {
    let server = messages_server();
    let session = SessionId::generate();
    let first = open(&server, session, Identity::Anonymous);
    send(&server, first, 5, "c1", "once");
    let committed = server.version();
    server.disconnect(first);

    let second = open(&server, session, Identity::Anonymous);
    let replies = server
        .handle_message(
            second,
            ClientMessage::Mutation {
                mutation_id: MutationId(5),
                name: "messages:send".into(),
                args: Value::object([
                    ("conversation", Value::from("c1")),
                    ("body", Value::from("once")),
                ]),
            },
        )
        .unwrap();
    let ServerMessage::MutationResponse {
        outcome: MutationOutcome::Success { commit_version, .. },
        ..
    } = &replies[0]
    else {
        panic!("expected success");
    };
    assert_eq!(*commit_version, committed);
    assert_eq!(server.documents("messages").unwrap().len(), 1);

    let ServerMessage::Transition(t) = &replies[1] else {
        panic!("expected transition");
    };
    assert_eq!(t.start_version, Version::ZERO);
    assert_eq!(t.end_version, committed);
}

#[test]
fn wire_round_trip_through_encoded_messages() {
    let server = messages_server();
    let conn = server.connect(Identity::Anonymous);
    let connect = ClientMessage::Connect {
        session_id: SessionId::generate(),
        max_observed_version: Version::ZERO,
    };
    let decoded = ClientMessage::decode(&connect.encode().unwrap()).unwrap();
    server.handle_message(conn, decoded).unwrap();

    let t = subscribe(
        &server,
        conn,
        0,
        1,
        PageRequest::new("messages", "by_id", KeyRange::all()),
    );
    let bytes = ServerMessage::Transition(t.clone()).encode().unwrap();
    assert_eq!(
        ServerMessage::decode(&bytes).unwrap(),
        ServerMessage::Transition(t)
    );
}
