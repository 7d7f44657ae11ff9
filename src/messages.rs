/// Message Store Module
///
/// Bot responses live in the `message` table. Several rows may share a
/// name; reads pick one of them at random.

use crate::core::db::{value_to_text, Condition, Database, SelectQuery, Value};
use crate::core::Result;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::sync::Arc;
use tracing::warn;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{|\}\}|\{(\d+)\}").expect("valid placeholder pattern"));

/// Replaces `{0}`, `{1}`, … with positional arguments.
///
/// `{{` and `}}` produce literal braces. Placeholders without a matching
/// argument are left as they are.
pub fn format_message(template: &str, args: &[&str]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match caps.get(1) {
            Some(index) => index
                .as_str()
                .parse::<usize>()
                .ok()
                .and_then(|i| args.get(i))
                .map(|arg| arg.to_string())
                .unwrap_or_else(|| caps[0].to_string()),
            None => caps[0][..1].to_string(),
        })
        .into_owned()
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        MessageStore { db }
    }

    /// Every text stored under `name`, in insertion order
    pub fn messages(&self, name: &str) -> Vec<String> {
        let query = SelectQuery::new(["message_text"])
            .from("message")
            .and_where([Condition::eq("message_name", name.to_string())]);
        self.db
            .execute_select(&query)
            .iter()
            .filter_map(|row| row.first().map(value_to_text))
            .collect()
    }

    /// One of the texts stored under `name`, chosen at random; empty when
    /// there are none.
    pub fn get(&self, name: &str) -> String {
        let mut texts = self.messages(name);
        if texts.is_empty() {
            warn!(message = name, "Message not found in message table");
            return String::new();
        }
        let index = rand::random_range(0..texts.len());
        texts.swap_remove(index)
    }

    /// Like [`MessageStore::get`], with `{n}` placeholders filled in
    pub fn get_with_args(&self, name: &str, args: &[&str]) -> String {
        format_message(&self.get(name), args)
    }

    /// Content of the first message with this title
    pub fn content(&self, title: &str) -> Result<String> {
        self.db.get_message_content(title)
    }

    /// Stores a new message variant; returns its id, or -1 on failure
    pub fn save(&self, name: &str, description: &str, content: &str) -> i64 {
        self.db.insert(
            "message",
            &[
                Value::Null,
                Value::Text(name.to_string()),
                Value::Text(description.to_string()),
                Value::Text(content.to_string()),
                Value::Integer(1),
            ],
        )
    }
}
