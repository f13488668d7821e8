//! Conversation history and progress.
//!
//! The history is append-only and its insertion order is what gets sent to
//! the pipeline. Progress follows the step count reported by the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::transport::{HistoryEntry, WireRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Examiner,
    Candidate,
}

impl Role {
    fn wire(self) -> WireRole {
        match self {
            Role::Examiner => WireRole::Ai,
            Role::Candidate => WireRole::Student,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn examiner(text: impl Into<String>) -> Self {
        Self::new(Role::Examiner, text)
    }

    pub fn candidate(text: impl Into<String>) -> Self {
        Self::new(Role::Candidate, text)
    }

    fn to_wire(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role.wire(),
            content: self.text.clone(),
            timestamp: self.recorded_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationProgress {
    pub step_count: u32,
    pub completed: bool,
}

/// Ordered turns plus step tracking for one session.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    turns: Vec<ConversationTurn>,
    /// Leading turns shown to the candidate but never sent upstream
    local_prefix: usize,
    progress: ConversationProgress,
    turn_limit: u32,
}

impl ConversationLog {
    pub fn new(turn_limit: u32) -> Self {
        Self {
            turns: Vec::new(),
            local_prefix: 0,
            progress: ConversationProgress {
                step_count: 0,
                completed: turn_limit == 0,
            },
            turn_limit,
        }
    }

    /// Start with the examiner's greeting as the first, local-only turn.
    pub fn with_greeting(turn_limit: u32, greeting: Option<&str>) -> Self {
        let mut log = Self::new(turn_limit);
        if let Some(text) = greeting.filter(|g| !g.trim().is_empty()) {
            log.turns.push(ConversationTurn::examiner(text));
            log.local_prefix = 1;
        }
        log
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn progress(&self) -> ConversationProgress {
        self.progress
    }

    /// History in the pipeline's wire format, greeting excluded.
    pub fn wire_history(&self) -> Vec<HistoryEntry> {
        self.turns[self.local_prefix..]
            .iter()
            .map(ConversationTurn::to_wire)
            .collect()
    }

    /// Append a successful exchange: transcript first, then the reply.
    pub fn record_exchange(&mut self, transcript: &str, reply: &str) {
        self.turns.push(ConversationTurn::candidate(transcript));
        self.turns.push(ConversationTurn::examiner(reply));
    }

    /// Append a single examiner line after a failed turn.
    pub fn record_apology(&mut self, message: &str) {
        self.turns.push(ConversationTurn::examiner(message));
    }

    /// Take the pipeline's step count. Values below the current count are
    /// clamped so progress never goes backwards. Returns the resulting count.
    pub fn advance_step(&mut self, reported: u32) -> u32 {
        if reported < self.progress.step_count {
            log::warn!(
                "Pipeline reported step {} below current {}, keeping current",
                reported,
                self.progress.step_count
            );
        } else {
            self.progress.step_count = reported;
        }

        if !self.progress.completed && self.progress.step_count >= self.turn_limit {
            log::info!(
                "Conversation complete at step {} (limit {})",
                self.progress.step_count,
                self.turn_limit
            );
            self.progress.completed = true;
        }
        self.progress.step_count
    }
}
