//! Chat and message data model.
//!
//! `MessageRecord` is the persisted shape; `MessageView` is the readable
//! projection handed to API callers and room subscribers. When encryption at
//! rest is enabled the record carries only the envelope and the view is
//! recovered by decrypting it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::crypto::MessageCipher;
use crate::error::Error;
use crate::language::Language;

/// One member of a chat, with the language they read in.
///
/// Language preferences are owned by the user directory; this is a read-only
/// snapshot taken when the chat is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: Uuid,
    pub native_language: Language,
}

/// A two-person chat. Exactly two participants, at most one chat per
/// unordered pair; the pair-uniqueness rule is enforced by the persistence
/// layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participant(user_id).is_some()
    }
}

/// The plaintext payload of a message: the sender's original text plus the
/// per-language translation map. This is exactly what the encryption
/// envelope wraps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    pub original_text: String,
    pub translations: BTreeMap<Language, String>,
}

/// A message as persisted. Immutable after creation.
///
/// Plaintext fields and the envelope are mutually exclusive: when
/// `is_encrypted` is set the envelope is canonical and the plaintext fields
/// are withheld entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translations: Option<BTreeMap<Language, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    pub is_encrypted: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Build a plaintext record.
    pub fn plaintext(chat_id: Uuid, sender_id: Uuid, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            original_text: Some(content.original_text),
            translations: Some(content.translations),
            encrypted_content: None,
            is_encrypted: false,
            created_at: Utc::now(),
        }
    }

    /// Build a record whose content lives in an encryption envelope.
    pub fn encrypted(chat_id: Uuid, sender_id: Uuid, envelope: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            original_text: None,
            translations: None,
            encrypted_content: Some(envelope),
            is_encrypted: true,
            created_at: Utc::now(),
        }
    }

    /// Produce the readable projection of this record.
    ///
    /// Encrypted records need the process cipher; a record that cannot be
    /// made readable is reported as `Error::Decryption`, never silently
    /// dropped.
    pub fn to_view(&self, cipher: Option<&MessageCipher>) -> Result<MessageView, Error> {
        let content = if self.is_encrypted {
            let envelope = self.encrypted_content.as_deref().ok_or_else(|| {
                Error::Decryption("message flagged encrypted but has no envelope".to_string())
            })?;
            let cipher = cipher.ok_or_else(|| {
                Error::Decryption("encrypted message but no encryption key configured".to_string())
            })?;
            cipher.decrypt_value::<MessageContent>(envelope)?
        } else {
            MessageContent {
                original_text: self.original_text.clone().ok_or_else(|| {
                    Error::Decryption("message record has no readable text".to_string())
                })?,
                translations: self.translations.clone().unwrap_or_default(),
            }
        };

        Ok(MessageView {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            original_text: content.original_text,
            translations: content.translations,
            is_encrypted: self.is_encrypted,
            created_at: self.created_at,
        })
    }
}

/// Readable message projection: what the ingestion endpoint returns and what
/// room subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub original_text: String,
    pub translations: BTreeMap<Language, String>,
    pub is_encrypted: bool,
    pub created_at: DateTime<Utc>,
}
