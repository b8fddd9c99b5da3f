//! Structured message filters

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::EmailLabel;

/// Optional predicates over stored messages; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub account_id: Option<i64>,
    pub folder: Option<String>,
    pub label: Option<EmailLabel>,
    /// Substring of the sender
    pub from: Option<String>,
    /// Substring of the recipients
    pub to: Option<String>,
    /// Inclusive lower bound, unix seconds
    pub date_from: Option<i64>,
    /// Inclusive upper bound, unix seconds
    pub date_to: Option<i64>,
}

impl MessageFilter {
    pub fn for_account(account_id: i64) -> Self {
        Self {
            account_id: Some(account_id),
            ..Self::default()
        }
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn label(mut self, label: EmailLabel) -> Self {
        self.label = Some(label);
        self
    }

    pub fn between(mut self, date_from: Option<i64>, date_to: Option<i64>) -> Self {
        self.date_from = date_from;
        self.date_to = date_to;
        self
    }

    /// Append `WHERE ...` for this filter to a query over `emails`
    pub(crate) fn push_where(&self, query: &mut QueryBuilder<'_, Sqlite>) {
        query.push(" WHERE 1 = 1");

        if let Some(account_id) = self.account_id {
            query.push(" AND account_id = ").push_bind(account_id);
        }
        if let Some(folder) = &self.folder {
            query.push(" AND folder = ").push_bind(folder.clone());
        }
        if let Some(label) = self.label {
            query
                .push(
                    " AND EXISTS (SELECT 1 FROM json_each(emails.labels) \
                     WHERE json_extract(json_each.value, '$.label') = ",
                )
                .push_bind(label.as_str())
                .push(")");
        }
        if let Some(from) = &self.from {
            query
                .push(" AND from_address LIKE ")
                .push_bind(format!("%{}%", from));
        }
        if let Some(to) = &self.to {
            query
                .push(" AND (to_address LIKE ")
                .push_bind(format!("%{}%", to))
                .push(" OR cc_address LIKE ")
                .push_bind(format!("%{}%", to))
                .push(")");
        }
        if let Some(date_from) = self.date_from {
            query.push(" AND date >= ").push_bind(date_from);
        }
        if let Some(date_to) = self.date_to {
            query.push(" AND date <= ").push_bind(date_to);
        }
    }
}

/// 1-based page of results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Page {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page: page.max(1),
            size: size.clamp(1, 500),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, size: 20 }
    }
}
