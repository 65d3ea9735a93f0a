use crate::types::Message;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MessageCache {
    entries: Mutex<HashMap<String, Message>>,
    max_messages: Option<usize>,
}

impl MessageCache {
    pub fn new(max_messages: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_messages: max_messages.filter(|max| *max > 0),
        }
    }

    pub fn insert(&self, message: Message) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(message.id.clone(), message);
        if let Some(max) = self.max_messages {
            while entries.len() > max {
                let oldest = entries
                    .values()
                    .min_by_key(|m| m.timestamp)
                    .map(|m| m.id.clone());
                match oldest {
                    Some(id) => {
                        entries.remove(&id);
                    }
                    None => break,
                }
            }
        }
    }

    /// Messages with `timestamp >= min_timestamp`, most recent first.
    pub fn query(&self, min_timestamp: u64) -> Vec<Message> {
        let mut out: Vec<Message> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .values()
                .filter(|m| m.timestamp >= min_timestamp)
                .cloned()
                .collect()
        };
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
