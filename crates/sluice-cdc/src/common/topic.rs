//! Topic naming
//!
//! | Record kind | Topic |
//! |-------------|-------|
//! | Data change | `<prefix>.<catalog>.<schema>.<table>` |
//! | Schema change | `<prefix>` |
//! | Transaction boundary | `<prefix>.transaction` |
//! | Heartbeat | `<heartbeat prefix>.<prefix>` |

use crate::common::config::ConnectorConfig;
use crate::common::schema::TableId;

/// Derives topic names from the connector's logical name.
#[derive(Debug, Clone)]
pub struct TopicNamingStrategy {
    prefix: String,
    heartbeat_prefix: String,
}

impl TopicNamingStrategy {
    pub fn new(prefix: impl Into<String>, heartbeat_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            heartbeat_prefix: heartbeat_prefix.into(),
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(&config.topic_prefix, &config.heartbeat_topics_prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn data_change_topic(&self, id: &TableId) -> String {
        format!(
            "{}.{}.{}.{}",
            self.prefix,
            sanitize(&id.catalog),
            sanitize(&id.schema),
            sanitize(&id.table)
        )
    }

    pub fn schema_change_topic(&self) -> String {
        self.prefix.clone()
    }

    pub fn transaction_topic(&self) -> String {
        format!("{}.transaction", self.prefix)
    }

    pub fn heartbeat_topic(&self) -> String {
        format!("{}.{}", self.heartbeat_prefix, self.prefix)
    }
}

/// Replace characters that are not valid in topic names.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let topics = TopicNamingStrategy::new("srv1", "__debezium-heartbeat");
        let id = TableId::new("testdb", "dbo", "orders");

        assert_eq!(topics.data_change_topic(&id), "srv1.testdb.dbo.orders");
        assert_eq!(topics.schema_change_topic(), "srv1");
        assert_eq!(topics.transaction_topic(), "srv1.transaction");
        assert_eq!(topics.heartbeat_topic(), "__debezium-heartbeat.srv1");
    }

    #[test]
    fn test_sanitizes_invalid_characters() {
        let topics = TopicNamingStrategy::new("srv1", "hb");
        let id = TableId::new("test db", "dbo", "order$");
        assert_eq!(topics.data_change_topic(&id), "srv1.test_db.dbo.order_");
    }
}
