//! Integration tests for the translate-on-write message pipeline.
//!
//! These drive the full ingestion flow — directory lookup, translation
//! backend (mocked with wiremock), persistence, and room broadcast — with
//! in-memory collaborators standing in for the database.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use babelchat::error::Error;
use babelchat::language::Language;
use babelchat::model::{Chat, MessageRecord, Participant};
use babelchat::pipeline::MessagePipeline;
use babelchat::retry::RetryConfig;
use babelchat::rooms::{RoomEvent, RoomRegistry};
use babelchat::routes;
use babelchat::store::{ChatDirectory, MessageStore};
use babelchat::translation::TranslationClient;

// ==================== In-Memory Collaborators ====================

#[derive(Clone, Default)]
struct InMemoryDirectory {
    chats: Arc<Mutex<HashMap<Uuid, Chat>>>,
}

impl InMemoryDirectory {
    fn insert(&self, chat: Chat) {
        self.chats.lock().unwrap().insert(chat.id, chat);
    }
}

impl ChatDirectory for InMemoryDirectory {
    async fn find_chat(&self, chat_id: Uuid) -> Result<Option<Chat>, Error> {
        Ok(self.chats.lock().unwrap().get(&chat_id).cloned())
    }
}

#[derive(Clone, Default)]
struct InMemoryStore {
    records: Arc<Mutex<Vec<MessageRecord>>>,
    fail: Arc<AtomicBool>,
}

impl MessageStore for InMemoryStore {
    async fn append(&self, record: &MessageRecord) -> Result<(), Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Persistence(sqlx::Error::PoolClosed));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ==================== Test Helpers ====================

struct TestChat {
    chat_id: Uuid,
    alice: Uuid,
    bob: Uuid,
}

fn seed_chat(
    directory: &InMemoryDirectory,
    alice_lang: &str,
    bob_lang: &str,
) -> TestChat {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let chat = Chat {
        id: Uuid::new_v4(),
        participants: vec![
            Participant {
                user_id: alice,
                native_language: Language::from_code(alice_lang).unwrap(),
            },
            Participant {
                user_id: bob,
                native_language: Language::from_code(bob_lang).unwrap(),
            },
        ],
        created_by: alice,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let ids = TestChat { chat_id: chat.id, alice, bob };
    directory.insert(chat);
    ids
}

fn translator(api_url: &str) -> TranslationClient {
    TranslationClient::new(
        &format!("{api_url}/v1/chat/completions"),
        "test-api-key",
        "gpt-4o-mini",
        Duration::from_secs(5),
    )
    .unwrap()
    .with_retry(RetryConfig::new(2, Duration::from_millis(1)))
}

fn build_pipeline(
    directory: InMemoryDirectory,
    store: InMemoryStore,
    api_url: &str,
) -> Arc<MessagePipeline<InMemoryDirectory, InMemoryStore>> {
    Arc::new(MessagePipeline::new(
        directory,
        store,
        translator(api_url),
        None,
        RoomRegistry::new(),
        1000,
    ))
}

fn chat_completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "choices": [
            {
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }
        ]
    })
}

// ==================== Translation Map Shape ====================

#[tokio::test]
async fn test_differing_languages_produce_exactly_two_keys() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("Hola mundo")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "es");
    let store = InMemoryStore::default();
    let pipeline = build_pipeline(directory, store.clone(), &mock_server.uri());

    let view = pipeline
        .ingest(ids.chat_id, ids.alice, "Hello world")
        .await
        .expect("Should ingest");

    assert_eq!(view.translations.len(), 2);
    assert_eq!(
        view.translations.get(&Language::ENGLISH).map(String::as_str),
        Some("Hello world")
    );
    assert_eq!(
        view.translations.get(&Language::SPANISH).map(String::as_str),
        Some("Hola mundo")
    );

    // Persisted record carries the same map
    let records = store.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].translations.as_ref().unwrap().len(), 2);
}

#[tokio::test]
async fn test_shared_language_makes_no_backend_call() {
    let mock_server = MockServer::start().await;
    // Any request to the backend fails the test
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("unused")))
        .expect(0)
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "fr", "fr");
    let pipeline = build_pipeline(directory, InMemoryStore::default(), &mock_server.uri());

    let view = pipeline
        .ingest(ids.chat_id, ids.bob, "Bonjour")
        .await
        .expect("Should ingest");

    assert_eq!(view.translations.len(), 1);
    assert_eq!(
        view.translations
            .get(&Language::from_code("fr").unwrap())
            .map(String::as_str),
        Some("Bonjour")
    );
}

#[tokio::test]
async fn test_sender_language_is_never_overwritten_by_backend() {
    // The gateway only honors requested target keys: a stray entry for the
    // sender's language is dropped, and the pipeline writes the original
    // text for that key last.
    let mock_server = MockServer::start().await;
    let conflicting = r#"{"es": "Hola", "fr": "Bonjour", "en": "EVIL OVERWRITE"}"#;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion(conflicting)))
        .mount(&mock_server)
        .await;

    let client = translator(&mock_server.uri());
    let targets: BTreeSet<Language> = ["es", "fr"]
        .iter()
        .map(|c| Language::from_code(c).unwrap())
        .collect();
    let result = client.translate("original", Language::ENGLISH, &targets).await;

    assert_eq!(result.len(), 2);
    assert!(!result.contains_key(&Language::ENGLISH));
}

// ==================== Backend Failure Behavior ====================

#[tokio::test]
async fn test_backend_failure_still_ingests_and_broadcasts_with_fallback() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend down"))
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "es");
    let pipeline = build_pipeline(directory, InMemoryStore::default(), &mock_server.uri());
    let mut subscription = pipeline.rooms().join(ids.chat_id).await;

    let view = pipeline
        .ingest(ids.chat_id, ids.alice, "Hello")
        .await
        .expect("Translation failure must not fail ingestion");

    assert_eq!(view.translations.len(), 2);
    assert_eq!(
        view.translations.get(&Language::SPANISH).map(String::as_str),
        Some("[ES] Hello")
    );

    let RoomEvent::NewMessage(event) = subscription.recv().await.expect("Should broadcast");
    assert_eq!(event.id, view.id);
}

#[tokio::test]
async fn test_backend_garbage_response_falls_back_and_ingest_succeeds() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "ja");
    let pipeline = build_pipeline(directory, InMemoryStore::default(), &mock_server.uri());

    let view = pipeline
        .ingest(ids.chat_id, ids.alice, "Hi")
        .await
        .expect("Should ingest");

    assert_eq!(
        view.translations
            .get(&Language::from_code("ja").unwrap())
            .map(String::as_str),
        Some("[JA] Hi")
    );
}

// ==================== Persistence and Broadcast Contract ====================

#[tokio::test]
async fn test_persistence_failure_never_broadcasts() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("Hola")))
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "es");
    let store = InMemoryStore::default();
    let pipeline = build_pipeline(directory, store.clone(), &mock_server.uri());
    let mut subscription = pipeline.rooms().join(ids.chat_id).await;

    store.fail.store(true, Ordering::SeqCst);
    let result = pipeline.ingest(ids.chat_id, ids.alice, "doomed").await;
    assert!(matches!(result, Err(Error::Persistence(_))));
    assert!(store.records.lock().unwrap().is_empty());

    // The next successful message is the first thing the subscriber sees
    store.fail.store(false, Ordering::SeqCst);
    pipeline.ingest(ids.chat_id, ids.alice, "survivor").await.unwrap();

    let RoomEvent::NewMessage(event) = subscription.recv().await.unwrap();
    assert_eq!(event.original_text, "survivor");
}

#[tokio::test]
async fn test_concurrent_ingests_broadcast_in_persisted_order() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("Hola")))
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "es");
    let store = InMemoryStore::default();
    let pipeline = build_pipeline(directory, store.clone(), &mock_server.uri());
    let mut subscription = pipeline.rooms().join(ids.chat_id).await;

    let (first, second) = tokio::join!(
        pipeline.ingest(ids.chat_id, ids.alice, "one"),
        pipeline.ingest(ids.chat_id, ids.bob, "two"),
    );
    first.unwrap();
    second.unwrap();

    let RoomEvent::NewMessage(event_a) = subscription.recv().await.unwrap();
    let RoomEvent::NewMessage(event_b) = subscription.recv().await.unwrap();

    // Whatever order persistence settled on, broadcast matches it
    let persisted_ids: Vec<Uuid> = store
        .records
        .lock()
        .unwrap()
        .iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(persisted_ids, vec![event_a.id, event_b.id]);
}

#[tokio::test]
async fn test_left_subscriber_receives_nothing_further() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("Hola")))
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "es");
    let pipeline = build_pipeline(directory, InMemoryStore::default(), &mock_server.uri());

    // Join, then leave before anything is sent
    let subscription = pipeline.rooms().join(ids.chat_id).await;
    drop(subscription);

    pipeline.ingest(ids.chat_id, ids.alice, "missed").await.unwrap();

    // A later subscriber starts clean: only post-join messages arrive
    let mut late = pipeline.rooms().join(ids.chat_id).await;
    pipeline.ingest(ids.chat_id, ids.alice, "fresh").await.unwrap();

    let RoomEvent::NewMessage(event) = late.recv().await.unwrap();
    assert_eq!(event.original_text, "fresh");
}

// ==================== HTTP Surface ====================

async fn spawn_server(
    pipeline: Arc<MessagePipeline<InMemoryDirectory, InMemoryStore>>,
) -> String {
    let app = routes::router(pipeline);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_http_send_message_returns_created_with_translations() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("Hallo Welt")))
        .mount(&mock_server)
        .await;

    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "de");
    let pipeline = build_pipeline(directory, InMemoryStore::default(), &mock_server.uri());
    let base = spawn_server(pipeline).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/chats/{}/messages", ids.chat_id))
        .header("x-user-id", ids.alice.to_string())
        .json(&serde_json::json!({ "originalText": "Hello world" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["translations"]["de"], "Hallo Welt");
    assert_eq!(body["data"]["translations"]["en"], "Hello world");
}

#[tokio::test]
async fn test_http_rejects_missing_sender_empty_text_and_unknown_chat() {
    let mock_server = MockServer::start().await;
    let directory = InMemoryDirectory::default();
    let ids = seed_chat(&directory, "en", "es");
    let pipeline = build_pipeline(directory, InMemoryStore::default(), &mock_server.uri());
    let base = spawn_server(pipeline).await;
    let client = reqwest::Client::new();

    // No authenticated sender
    let response = client
        .post(format!("{base}/api/chats/{}/messages", ids.chat_id))
        .json(&serde_json::json!({ "originalText": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);

    // Empty text
    let response = client
        .post(format!("{base}/api/chats/{}/messages", ids.chat_id))
        .header("x-user-id", ids.alice.to_string())
        .json(&serde_json::json!({ "originalText": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Unknown chat
    let response = client
        .post(format!("{base}/api/chats/{}/messages", Uuid::new_v4()))
        .header("x-user-id", ids.alice.to_string())
        .json(&serde_json::json!({ "originalText": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    // Non-participant sender
    let response = client
        .post(format!("{base}/api/chats/{}/messages", ids.chat_id))
        .header("x-user-id", Uuid::new_v4().to_string())
        .json(&serde_json::json!({ "originalText": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
}
