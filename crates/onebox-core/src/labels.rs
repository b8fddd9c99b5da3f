//! Classifier labels attached to stored messages

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of labels the classifier may assign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmailLabel {
    #[serde(rename = "Interested")]
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    #[serde(rename = "Spam")]
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
}

impl EmailLabel {
    pub const ALL: [EmailLabel; 5] = [
        EmailLabel::Interested,
        EmailLabel::MeetingBooked,
        EmailLabel::NotInterested,
        EmailLabel::Spam,
        EmailLabel::OutOfOffice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailLabel::Interested => "Interested",
            EmailLabel::MeetingBooked => "Meeting Booked",
            EmailLabel::NotInterested => "Not Interested",
            EmailLabel::Spam => "Spam",
            EmailLabel::OutOfOffice => "Out of Office",
        }
    }
}

impl fmt::Display for EmailLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailLabel {
    type Err = String;

    /// Case-insensitive, so model output like "interested" is accepted
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown label: {}", wanted))
    }
}

/// One classification result attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub label: EmailLabel,
    pub confidence: f32,
    pub model: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl LabelEntry {
    pub fn new(label: EmailLabel, confidence: f32, model: impl Into<String>) -> Self {
        Self {
            label,
            confidence,
            model: model.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Ordered set of label entries, at most one per label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(Vec<LabelEntry>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; an entry for the same label is replaced in place
    pub fn insert(&mut self, entry: LabelEntry) {
        match self.0.iter_mut().find(|e| e.label == entry.label) {
            Some(existing) => *existing = entry,
            None => self.0.push(entry),
        }
    }

    /// Remove the entry for `label`, returning whether one was present
    pub fn remove(&mut self, label: EmailLabel) -> bool {
        let before = self.0.len();
        self.0.retain(|e| e.label != label);
        self.0.len() != before
    }

    pub fn contains(&self, label: EmailLabel) -> bool {
        self.0.iter().any(|e| e.label == label)
    }

    pub fn get(&self, label: EmailLabel) -> Option<&LabelEntry> {
        self.0.iter().find(|e| e.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = EmailLabel> + '_ {
        self.0.iter().map(|e| e.label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_names_round_trip() {
        for label in EmailLabel::ALL {
            assert_eq!(label.as_str().parse::<EmailLabel>(), Ok(label));
        }
        assert_eq!("out of office".parse(), Ok(EmailLabel::OutOfOffice));
        assert!("Urgent".parse::<EmailLabel>().is_err());
    }

    #[test]
    fn test_serialized_form_uses_display_names() {
        let json = serde_json::to_string(&EmailLabel::MeetingBooked).unwrap();
        assert_eq!(json, "\"Meeting Booked\"");
    }

    #[test]
    fn test_insert_replaces_same_label() {
        let mut set = LabelSet::new();
        set.insert(LabelEntry::new(EmailLabel::Interested, 0.6, "a"));
        set.insert(LabelEntry::new(EmailLabel::Spam, 0.2, "a"));
        set.insert(LabelEntry::new(EmailLabel::Interested, 0.9, "b"));

        assert_eq!(set.len(), 2);
        let entry = set.get(EmailLabel::Interested).unwrap();
        assert_eq!(entry.confidence, 0.9);
        assert_eq!(entry.model, "b");
        assert_eq!(
            set.labels().collect::<Vec<_>>(),
            vec![EmailLabel::Interested, EmailLabel::Spam]
        );
    }

    #[test]
    fn test_remove_is_set_difference() {
        let mut set = LabelSet::new();
        set.insert(LabelEntry::new(EmailLabel::Spam, 1.0, "m"));

        assert!(set.remove(EmailLabel::Spam));
        assert!(!set.remove(EmailLabel::Spam));
        assert!(set.is_empty());
    }
}
