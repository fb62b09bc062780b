//! Calendar and email-draft collaborators
//!
//! The agent only supplies slot values; looking up events and storing drafts
//! belong to whatever implements these traits.

use crate::agent::intent::DateRange;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One calendar entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
}

/// An email to be stored as a draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Acknowledgement from the email collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftReceipt {
    pub draft_id: String,
}

/// Event lookup by date range
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Events overlapping `range`, ordered by start time
    async fn events(&self, range: &DateRange) -> Result<Vec<CalendarEvent>>;
}

/// Draft creation
#[async_trait]
pub trait EmailDrafter: Send + Sync {
    async fn create_draft(&self, draft: &EmailDraft) -> Result<DraftReceipt>;
}

/// Plain-text listing of events for a chat reply
pub fn format_events(range: &DateRange, events: &[CalendarEvent]) -> String {
    if events.is_empty() {
        return format!("You have nothing scheduled for {}.", range);
    }

    let mut sorted: Vec<&CalendarEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.start);

    let mut out = format!("Here's what's on your calendar for {}:\n", range);
    for event in sorted {
        out.push_str(&format!(
            "- {} to {}: {}",
            event.start.format("%a %H:%M"),
            event.end.format("%H:%M"),
            event.title
        ));
        if !event.attendees.is_empty() {
            out.push_str(&format!(" (with {})", event.attendees.join(", ")));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
