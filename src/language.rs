//! Language type: flexible, validated language representation.
//!
//! Every language code that enters the system (participant preferences,
//! translation map keys) is validated against the supported set here, so
//! the rest of the crate only ever sees known codes.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry in the supported-language table.
struct LanguageEntry {
    /// ISO 639-1 language code (e.g., "en", "es")
    code: &'static str,
    /// English name, used when prompting the translation backend
    name: &'static str,
}

/// Languages the translation backend is asked to produce.
const SUPPORTED: &[LanguageEntry] = &[
    LanguageEntry { code: "en", name: "English" },
    LanguageEntry { code: "es", name: "Spanish" },
    LanguageEntry { code: "fr", name: "French" },
    LanguageEntry { code: "de", name: "German" },
    LanguageEntry { code: "it", name: "Italian" },
    LanguageEntry { code: "pt", name: "Portuguese" },
    LanguageEntry { code: "ja", name: "Japanese" },
    LanguageEntry { code: "ko", name: "Korean" },
    LanguageEntry { code: "zh", name: "Chinese" },
    LanguageEntry { code: "ar", name: "Arabic" },
    LanguageEntry { code: "ru", name: "Russian" },
    LanguageEntry { code: "hi", name: "Hindi" },
];

/// A validated language.
///
/// Can only be constructed from a code present in the supported table, so
/// holding a `Language` is proof the code is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Language {
    code: &'static str,
}

impl Language {
    pub const ENGLISH: Language = Language { code: "en" };
    pub const SPANISH: Language = Language { code: "es" };

    /// Create a Language from an ISO 639-1 code string.
    ///
    /// Returns `Error::Validation` for unknown codes; matching is
    /// case-insensitive so stored preferences like "ES" still resolve.
    pub fn from_code(code: &str) -> Result<Language, Error> {
        let lowered = code.to_ascii_lowercase();
        SUPPORTED
            .iter()
            .find(|entry| entry.code == lowered)
            .map(|entry| Language { code: entry.code })
            .ok_or_else(|| Error::Validation(format!("unsupported language code: '{code}'")))
    }

    /// The ISO 639-1 language code (e.g., "en", "es").
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// The English name of the language (e.g., "Spanish"), as sent to the
    /// translation backend.
    pub fn name(&self) -> &'static str {
        SUPPORTED
            .iter()
            .find(|entry| entry.code == self.code)
            .map(|entry| entry.name)
            .unwrap_or(self.code)
    }

    /// Deterministic placeholder used when no translation could be obtained
    /// for this language: a bracketed language tag in front of the original
    /// text, readable and attributable to its source.
    pub fn fallback_text(&self, original: &str) -> String {
        format!("[{}] {}", self.code.to_ascii_uppercase(), original)
    }

    /// All supported language codes.
    pub fn supported_codes() -> impl Iterator<Item = &'static str> {
        SUPPORTED.iter().map(|entry| entry.code)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

impl Serialize for Language {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code)
    }
}

impl<'de> Deserialize<'de> for Language {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Language::from_code(&code).map_err(serde::de::Error::custom)
    }
}
