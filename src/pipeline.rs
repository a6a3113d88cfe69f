//! Message ingestion pipeline.
//!
//! Orchestrates one message from submission to broadcast: resolve the chat
//! and authorize the sender, obtain translations for the languages the
//! other participant needs, optionally seal the content in an encryption
//! envelope, persist, then fan out to room subscribers. Persistence always
//! comes first; a message that failed to persist is never broadcast, and an
//! accepted message is broadcast exactly once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::MessageCipher;
use crate::error::Error;
use crate::model::{MessageContent, MessageRecord, MessageView};
use crate::rooms::{RoomEvent, RoomRegistry};
use crate::store::{ChatDirectory, MessageStore};
use crate::translation::TranslationClient;

pub struct MessagePipeline<D, S> {
    directory: D,
    store: S,
    translator: TranslationClient,
    cipher: Option<MessageCipher>,
    rooms: RoomRegistry,
    max_message_chars: usize,
    /// Per-chat ordering gates: held only across the append+publish pair so
    /// broadcast order matches persistence order within a chat. Never held
    /// across the translation or encryption steps, and one chat's gate
    /// never blocks another chat.
    chat_gates: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<D: ChatDirectory, S: MessageStore> MessagePipeline<D, S> {
    pub fn new(
        directory: D,
        store: S,
        translator: TranslationClient,
        cipher: Option<MessageCipher>,
        rooms: RoomRegistry,
        max_message_chars: usize,
    ) -> Self {
        Self {
            directory,
            store,
            translator,
            cipher,
            rooms,
            max_message_chars,
            chat_gates: RwLock::new(HashMap::new()),
        }
    }

    /// The room registry this pipeline publishes into.
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Ingest one message: validate, translate, persist, broadcast.
    ///
    /// Translation can never fail this call; persistence and authorization
    /// failures are surfaced verbatim.
    pub async fn ingest(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        original_text: &str,
    ) -> Result<MessageView, Error> {
        let text = original_text.trim();
        if text.is_empty() {
            return Err(Error::Validation("message text is required".to_string()));
        }
        if text.chars().count() > self.max_message_chars {
            return Err(Error::Validation(format!(
                "message text exceeds {} characters",
                self.max_message_chars
            )));
        }

        let chat = self
            .directory
            .find_chat(chat_id)
            .await?
            .ok_or_else(|| Error::NotFound("chat room not found".to_string()))?;

        let sender = chat.participant(sender_id).ok_or_else(|| {
            Error::Forbidden("not a participant in this chat room".to_string())
        })?;
        let sender_language = sender.native_language;

        // Distinct languages the other participants read in, minus the
        // sender's own. One batched backend call covers all of them.
        let targets: BTreeSet<_> = chat
            .participants
            .iter()
            .filter(|p| p.user_id != sender_id)
            .map(|p| p.native_language)
            .filter(|language| *language != sender_language)
            .collect();

        let mut translations = if targets.is_empty() {
            debug!("Chat {}: all participants share {}, skipping backend", chat_id, sender_language);
            Default::default()
        } else {
            self.translator
                .translate(text, sender_language, &targets)
                .await
        };

        // The sender's own text is authoritative; applied last so it wins
        // over anything the backend returned for that key.
        translations.insert(sender_language, text.to_string());

        let content = MessageContent {
            original_text: text.to_string(),
            translations,
        };

        let record = match &self.cipher {
            Some(cipher) => {
                let envelope = cipher.encrypt_value(&content)?;
                MessageRecord::encrypted(chat_id, sender_id, envelope)
            }
            None => MessageRecord::plaintext(chat_id, sender_id, content.clone()),
        };

        let view = MessageView {
            id: record.id,
            chat_id: record.chat_id,
            sender_id: record.sender_id,
            original_text: content.original_text,
            translations: content.translations,
            is_encrypted: record.is_encrypted,
            created_at: record.created_at,
        };

        // Append and publish under the chat's ordering gate. Append is the
        // durability boundary: on failure we abort here and nothing is
        // broadcast for this call.
        let gate = self.chat_gate(chat_id).await;
        let _ordering = gate.lock().await;

        self.store.append(&record).await?;

        let delivered = self
            .rooms
            .publish(chat_id, RoomEvent::NewMessage(view.clone()))
            .await;
        info!(
            "Chat {}: message {} persisted ({} languages), delivered to {} subscribers",
            chat_id,
            view.id,
            view.translations.len(),
            delivered
        );

        Ok(view)
    }

    async fn chat_gate(&self, chat_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(gate) = self.chat_gates.read().await.get(&chat_id) {
            return gate.clone();
        }
        let mut gates = self.chat_gates.write().await;
        // A gate whose only owner is the map itself has no ingest in
        // flight; drop those while we hold the write lock so the map
        // tracks active chats rather than every chat ever seen.
        gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        gates.entry(chat_id).or_default().clone()
    }
}
