use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use url::Url;

use tangent::server::router;
use tangent_core::api::{
    ApiError, ConversationApi, HttpConversationClient, InMemoryConversationStore, PathQuery,
};
use tangent_core::app::conversation::{Message, MessagePart, ParentKey, Role};
use tangent_core::app::domain::runtime::{EffectInterpreter, SessionOptions, spawn_session};
use tangent_core::app::domain::{ConversationId, GenerationOutcome, MessageId, SessionEvent};
use tangent_core::session::InMemoryClientStateStore;
use tangent_core::transport::{ReplyScript, ScriptedTransport};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

async fn serve(store: Arc<InMemoryConversationStore>) -> HttpConversationClient {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(store)).await.unwrap();
    });
    HttpConversationClient::new(Url::parse(&format!("http://{addr}/")).unwrap())
}

/// m1 ─┬─ m2
///     └─ m3 ── m4
async fn seeded(client: &HttpConversationClient) -> ConversationId {
    let conversation = client.create_conversation().await.unwrap();
    let messages = [
        Message::user(None, "hello").with_id("m1").with_created_at(at(0)),
        Message::assistant(Some(MessageId::from("m1")), "first")
            .with_id("m2")
            .with_created_at(at(10)),
        Message::assistant(Some(MessageId::from("m1")), "second")
            .with_id("m3")
            .with_created_at(at(20)),
        Message::user(Some(MessageId::from("m3")), "go on")
            .with_id("m4")
            .with_created_at(at(30)),
    ];
    for message in &messages {
        client.save_message(conversation, message).await.unwrap();
    }
    conversation
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn paths_and_branches_round_trip() {
    let client = serve(Arc::new(InMemoryConversationStore::new())).await;
    let conversation = seeded(&client).await;

    let canonical = client
        .fetch_path(conversation, &PathQuery::canonical())
        .await
        .unwrap();
    assert_eq!(ids(&canonical.messages), vec!["m1", "m3", "m4"]);
    assert_eq!(canonical.leaf_id, Some(MessageId::from("m4")));
    assert!(!canonical.has_more);

    let through = client
        .fetch_path(conversation, &PathQuery::through(MessageId::from("m2")))
        .await
        .unwrap();
    assert_eq!(ids(&through.messages), vec!["m1", "m2"]);

    let page = client
        .fetch_path(conversation, &PathQuery::before(MessageId::from("m4"), 1))
        .await
        .unwrap();
    assert_eq!(ids(&page.messages), vec!["m3"]);
    assert!(page.has_more);

    let branches = client.fetch_branches(conversation).await.unwrap();
    let forks: Vec<&str> = branches["m1"].iter().map(|e| e.id.as_str()).collect();
    assert_eq!(forks, vec!["m2", "m3"]);
    assert_eq!(branches[&ParentKey::Root.to_wire()].len(), 1);
}

#[tokio::test]
async fn writes_are_applied_on_the_server() {
    let store = Arc::new(InMemoryConversationStore::new());
    let client = serve(store.clone()).await;
    let conversation = seeded(&client).await;

    client
        .update_message(
            conversation,
            &MessageId::from("m2"),
            &[MessagePart::text("revised")],
        )
        .await
        .unwrap();
    client
        .set_active_leaf(conversation, Some(&MessageId::from("m2")))
        .await
        .unwrap();
    let path = client
        .fetch_path(conversation, &PathQuery::canonical())
        .await
        .unwrap();
    assert_eq!(ids(&path.messages), vec!["m1", "m2"]);
    assert_eq!(path.messages[1].extract_text(), "revised");

    let removed = client
        .delete_message(conversation, &MessageId::from("m3"))
        .await
        .unwrap();
    assert_eq!(removed, vec![MessageId::from("m3"), MessageId::from("m4")]);
    assert_eq!(store.messages(conversation).unwrap().len(), 2);
}

#[tokio::test]
async fn server_errors_keep_their_kind() {
    let client = serve(Arc::new(InMemoryConversationStore::new())).await;
    let conversation = seeded(&client).await;

    let missing = client
        .delete_message(conversation, &MessageId::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(missing, ApiError::NotFound { .. }), "{missing:?}");

    let duplicate = client
        .save_message(
            conversation,
            &Message::user(None, "again").with_id("m1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(duplicate, ApiError::Conflict { .. }), "{duplicate:?}");

    let in_place_user = client
        .update_message(conversation, &MessageId::from("m1"), &[MessagePart::text("x")])
        .await
        .unwrap_err();
    assert!(
        matches!(in_place_user, ApiError::InvalidRequest { .. }),
        "{in_place_user:?}"
    );

    let unknown = client
        .fetch_branches(ConversationId::new())
        .await
        .unwrap_err();
    assert!(matches!(unknown, ApiError::NotFound { .. }), "{unknown:?}");
}

#[tokio::test]
async fn session_over_http_streams_a_reply_and_switches_back() {
    let store = Arc::new(InMemoryConversationStore::new());
    let client = Arc::new(serve(store.clone()).await);
    let conversation = seeded(&client).await;

    let api: Arc<dyn ConversationApi> = client;
    let transport = Arc::new(
        ScriptedTransport::new(api.clone(), ReplyScript::Echo).with_chunk_delay(Duration::ZERO),
    );
    let interpreter = EffectInterpreter::new(
        conversation,
        api,
        transport,
        Arc::new(InMemoryClientStateStore::new()),
    );
    let session = spawn_session(interpreter, SessionOptions::default());
    session.open().await.unwrap();
    let mut events = session.subscribe().await.unwrap();

    session
        .send_message(vec![MessagePart::text("tell me more")])
        .await
        .unwrap();
    let finished = timeout(Duration::from_secs(5), async {
        loop {
            let envelope = events.recv().await.unwrap();
            if let SessionEvent::GenerationFinished { .. } = envelope.event {
                return envelope.event;
            }
        }
    })
    .await
    .unwrap();
    let SessionEvent::GenerationFinished {
        message_id: Some(reply_id),
        outcome: GenerationOutcome::Completed,
        ..
    } = finished
    else {
        panic!("expected a completed generation, got {finished:?}");
    };

    let stored = store.messages(conversation).unwrap();
    let reply = stored.iter().find(|m| m.id == reply_id).unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.extract_text(), "You said: tell me more");

    session
        .switch_branch(Some(MessageId::from("m2")), ParentKey::Message(MessageId::from("m1")))
        .await
        .unwrap();
    let state = session.state().await.unwrap();
    let visible: Vec<&str> = state.store.messages().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(visible, vec!["m1", "m2"]);

    session.shutdown();
}
