//! Transcript aggregation.
//!
//! Live transcription arrives as small fragments. Consecutive fragments from
//! the same speaker belong to one utterance; a change of speaker closes the
//! current utterance and opens a new one. Closed utterances are never touched
//! again.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub const fn from_is_user(is_user: bool) -> Self {
        if is_user { Self::User } else { Self::Agent }
    }

    pub const fn is_user(self) -> bool {
        matches!(self, Self::User)
    }
}

/// One contiguous block of text from one speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
    /// When the first fragment of this utterance arrived.
    pub timestamp: DateTime<Utc>,
}

/// Append-only, role-grouped transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    utterances: Vec<Utterance>,
}

impl Transcript {
    pub const fn new() -> Self {
        Self {
            utterances: Vec::new(),
        }
    }

    /// Merge a fragment into the transcript. Empty fragments are ignored.
    pub fn append(&mut self, text: &str, role: Role) {
        if text.is_empty() {
            return;
        }
        match self.utterances.last_mut() {
            Some(last) if last.role == role => last.text.push_str(text),
            _ => self.utterances.push(Utterance {
                role,
                text: text.to_string(),
                timestamp: Utc::now(),
            }),
        }
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn last(&self) -> Option<&Utterance> {
        self.utterances.last()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn clear(&mut self) {
        self.utterances.clear();
    }
}

/// Transcript shared between the session task (single writer) and readers.
#[derive(Debug, Clone, Default)]
pub struct SharedTranscript {
    inner: Arc<RwLock<Transcript>>,
}

impl SharedTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, text: &str, role: Role) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .append(text, role);
    }

    /// Copy of the transcript as it stands now.
    pub fn snapshot(&self) -> Transcript {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
