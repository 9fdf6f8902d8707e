use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Deserialize, Serialize};

/// A requested folder confirmed to exist on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedFolder {
    /// Name as requested by the user.
    pub name: String,
    /// Server name in modified UTF-7, used for EXAMINE.
    pub raw_name: String,
}

/// Envelope summary of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub envelope_date: Option<DateTime<FixedOffset>>,
    pub envelope_date_formatted: String,
    pub original_subject: String,
    /// Present only when sanitizing changed the subject.
    pub modified_subject: Option<String>,
}

impl Message {
    pub fn new(
        message_id: String,
        envelope_date: Option<DateTime<FixedOffset>>,
        original_subject: String,
        modified_subject: Option<String>,
    ) -> Self {
        let envelope_date_formatted = envelope_date
            .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        Self {
            message_id,
            envelope_date,
            envelope_date_formatted,
            original_subject,
            modified_subject,
        }
    }

    /// Subject to display: the modified one when present.
    pub fn display_subject(&self) -> &str {
        self.modified_subject
            .as_deref()
            .unwrap_or(&self.original_subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxCheckResult {
    pub mailbox_name: String,
    pub items_found: u32,
    pub messages: Vec<Message>,
}

impl MailboxCheckResult {
    pub fn empty(mailbox_name: impl Into<String>) -> Self {
        Self {
            mailbox_name: mailbox_name.into(),
            items_found: 0,
            messages: Vec::new(),
        }
    }
}

/// Per-folder results for one account, in folder order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxCheckResults(pub Vec<MailboxCheckResult>);

impl MailboxCheckResults {
    pub fn push(&mut self, result: MailboxCheckResult) {
        self.0.push(result);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MailboxCheckResult> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn got_mail(&self) -> bool {
        self.iter().any(|r| r.items_found > 0)
    }

    pub fn total_messages_found(&self) -> u64 {
        self.iter().map(|r| u64::from(r.items_found)).sum()
    }

    /// `Inbox(3), Spam(0)`
    pub fn messages_found_summary(&self) -> String {
        self.iter()
            .map(|r| format!("{}({})", r.mailbox_name, r.items_found))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<MailboxCheckResult> for MailboxCheckResults {
    fn from_iter<I: IntoIterator<Item = MailboxCheckResult>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a MailboxCheckResults {
    type Item = &'a MailboxCheckResult;
    type IntoIter = std::slice::Iter<'a, MailboxCheckResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
