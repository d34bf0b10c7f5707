use chrono::{DateTime, Utc};

/// A single record header. Kafka header keys are UTF-8; values are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message received from a claimed topic-partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// Headers in the order the producer wrote them.
    pub headers: Vec<Header>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// First header value stored under `key`.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }

    /// First header value under `key`, if it is valid UTF-8.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header(key).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// One delivery unit: a non-empty, offset-ordered run of messages from a single
/// topic-partition claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    pub fn new(first: Message) -> Self {
        Self::with_capacity(first, 1)
    }

    pub fn with_capacity(first: Message, capacity: usize) -> Self {
        let mut messages = Vec::with_capacity(capacity.max(1));
        messages.push(first);
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        debug_assert_eq!(message.topic, self.first().topic);
        debug_assert_eq!(message.partition, self.first().partition);
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false; kept for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first(&self) -> &Message {
        &self.messages[0]
    }

    pub fn last(&self) -> &Message {
        &self.messages[self.messages.len() - 1]
    }

    pub fn topic(&self) -> &str {
        &self.first().topic
    }

    pub fn partition(&self) -> i32 {
        self.first().partition
    }

    pub fn first_offset(&self) -> i64 {
        self.first().offset
    }

    pub fn last_offset(&self) -> i64 {
        self.last().offset
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::message;
    use super::*;

    #[test]
    fn test_batch_tracks_first_and_last() {
        let mut batch = Batch::with_capacity(message("orders", 2, 10), 4);
        batch.push(message("orders", 2, 11));
        batch.push(message("orders", 2, 12));

        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        assert_eq!(batch.topic(), "orders");
        assert_eq!(batch.partition(), 2);
        assert_eq!(batch.first_offset(), 10);
        assert_eq!(batch.last_offset(), 12);
        assert_eq!(
            batch.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );
    }

    #[test]
    fn test_header_lookup_returns_first_match() {
        let mut msg = message("orders", 0, 1);
        msg.headers = vec![
            Header::new("x-trace-id", "abc"),
            Header::new("x-trace-id", "def"),
            Header::new("binary", vec![0xff, 0xfe]),
        ];

        assert_eq!(msg.header("x-trace-id"), Some(&b"abc"[..]));
        assert_eq!(msg.header_str("x-trace-id"), Some("abc"));
        assert_eq!(msg.header_str("binary"), None);
        assert_eq!(msg.header("missing"), None);
    }
}
