//! A small chat application used across tests.
//!
//! Two tables: `conversations` (`id`, `emoji`) listed newest first, and
//! `messages` (`conversation`, `body`) indexed by conversation.

use std::collections::BTreeMap;
use std::sync::Arc;

use synclane_engine::{
    FunctionRegistry, LocalDbReader, LocalSchema, LocalWriter, MutationSpec, QueryError,
    SyncQuery,
};
use synclane_protocol::{
    Direction, Document, IndexDefinition, KeyRange, BY_CREATION_TIME, BY_ID, CREATION_TIME_FIELD,
};
use synclane_server::{MemoryTable, ServerConfig, ServerResult, ServerWriter, SyncServer};
use synclane_value::Value;

/// Conversations table.
pub const CONVERSATIONS: &str = "conversations";
/// Messages table.
pub const MESSAGES: &str = "messages";
/// Messages index ordered by conversation, then creation time.
pub const BY_CONVERSATION: &str = "by_conversation";

/// Extra indexes of the messages table.
pub fn message_indexes() -> Vec<IndexDefinition> {
    vec![IndexDefinition::new(
        BY_CONVERSATION,
        vec!["conversation".to_string(), CREATION_TIME_FIELD.to_string()],
    )]
}

/// The client-side schema.
pub fn local_schema() -> LocalSchema {
    LocalSchema::new()
        .with_table(CONVERSATIONS, vec![])
        .with_table(MESSAGES, message_indexes())
}

/// A reference server with the chat tables and mutations.
pub fn chat_server() -> Arc<SyncServer> {
    chat_server_with(ServerConfig::default())
}

/// Like [`chat_server`] with a custom configuration.
pub fn chat_server_with(config: ServerConfig) -> Arc<SyncServer> {
    let server = SyncServer::new(config);
    server.add_table(MemoryTable::new(CONVERSATIONS, vec![]));
    server.add_table(MemoryTable::new(MESSAGES, message_indexes()));

    server.register_mutation("conversations:create", |w, args, _| {
        let id = args
            .get("id")
            .and_then(Value::as_text)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "conversation id must not be empty".to_string())?;
        let taken = w
            .query(CONVERSATIONS, BY_ID, KeyRange::all(), Direction::Asc)
            .map_err(|e| e.to_string())?
            .iter()
            .any(|doc| doc.get("id").as_text() == Some(id));
        if taken {
            return Err(format!("conversation {id} already exists"));
        }
        insert(w, CONVERSATIONS, args, &["id", "emoji"])?;
        Ok(Value::Null)
    });
    server.register_mutation("messages:send", |w, args, _| {
        if args.get("conversation").and_then(Value::as_text).is_none() {
            return Err("missing conversation".to_string());
        }
        let id = insert(w, MESSAGES, args, &["conversation", "body"])?;
        Ok(Value::from(id))
    });
    Arc::new(server)
}

fn insert(
    w: &mut ServerWriter<'_>,
    table: &str,
    args: &Value,
    fields: &[&str],
) -> Result<String, String> {
    let id = w
        .insert(table, pick(args, fields))
        .map_err(|e| e.to_string())?;
    Ok(id.0)
}

fn pick(args: &Value, fields: &[&str]) -> BTreeMap<String, Value> {
    fields
        .iter()
        .map(|f| (f.to_string(), args.get(f).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Arguments of `conversations:create`.
pub fn conversation_args(id: &str, emoji: &str) -> Value {
    Value::object([("id", Value::from(id)), ("emoji", Value::from(emoji))])
}

/// Arguments of `messages:send`.
pub fn message_args(conversation: &str, body: &str) -> Value {
    Value::object([
        ("conversation", Value::from(conversation)),
        ("body", Value::from(body)),
    ])
}

fn conversation_summary(doc: &Document) -> Value {
    Value::object([("id", doc.get("id")), ("emoji", doc.get("emoji"))])
}

/// Every conversation as `{id, emoji}`, newest first.
pub fn get_conversations() -> SyncQuery {
    SyncQuery::new(
        "conversations:list",
        |db: &mut LocalDbReader<'_>, _: &Value| {
            let docs = db
                .query(CONVERSATIONS, BY_CREATION_TIME)
                .order(Direction::Desc)
                .collect()?;
            Ok(Value::Array(docs.iter().map(conversation_summary).collect()))
        },
    )
}

/// Message bodies of one conversation, oldest first. Takes
/// `{conversation}`.
pub fn get_messages() -> SyncQuery {
    SyncQuery::new("messages:list", |db: &mut LocalDbReader<'_>, args: &Value| {
        let conversation = args
            .get("conversation")
            .cloned()
            .ok_or_else(|| QueryError::failed("missing conversation"))?;
        let docs = db
            .query(MESSAGES, BY_CONVERSATION)
            .prefix(vec![conversation])
            .collect()?;
        Ok(Value::Array(docs.iter().map(|d| d.get("body")).collect()))
    })
}

/// `conversations:create` with its optimistic update.
pub fn create_conversation() -> MutationSpec {
    MutationSpec::new("conversations:create").with_optimistic(
        |w: &mut LocalWriter<'_>, args: &Value| {
            w.insert(CONVERSATIONS, pick(args, &["id", "emoji"]))?;
            Ok(())
        },
    )
}

/// `messages:send` with its optimistic update.
pub fn send_message() -> MutationSpec {
    MutationSpec::new("messages:send").with_optimistic(|w: &mut LocalWriter<'_>, args: &Value| {
        w.insert(MESSAGES, pick(args, &["conversation", "body"]))?;
        Ok(())
    })
}

/// Mutation specs for reloading persisted mutations.
pub fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with_mutation(create_conversation())
        .with_mutation(send_message())
}

/// What `get_conversations` must converge to, computed from the server's
/// tables.
pub fn expected_conversations(server: &SyncServer) -> ServerResult<Value> {
    let mut docs = server.documents(CONVERSATIONS)?;
    docs.sort_by(|a, b| (b.creation_time, &b.id).cmp(&(a.creation_time, &a.id)));
    Ok(Value::Array(docs.iter().map(conversation_summary).collect()))
}

/// What `get_messages` must converge to for one conversation.
pub fn expected_messages(server: &SyncServer, conversation: &str) -> ServerResult<Value> {
    let mut docs: Vec<Document> = server
        .documents(MESSAGES)?
        .into_iter()
        .filter(|d| d.get("conversation").as_text() == Some(conversation))
        .collect();
    docs.sort_by(|a, b| (a.creation_time, &a.id).cmp(&(b.creation_time, &b.id)));
    Ok(Value::Array(docs.iter().map(|d| d.get("body")).collect()))
}
