//! MQTT topic filter matching
//!
//! Used by the embedded broker to route publishes to subscriptions.
//! `+` matches one level, `#` matches the remaining levels (parent included).

/// Topic matcher for MQTT topic filters
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicMatcher;

impl TopicMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a topic name matches a subscription filter
    ///
    /// Topics starting with `$` are never matched by a leading wildcard.
    ///
    /// ```
    /// use mqtt_protocol_gateway::mqtt::TopicMatcher;
    ///
    /// let matcher = TopicMatcher::new();
    /// assert!(matcher.matches("gateway/response", "gateway/+"));
    /// assert!(matcher.matches("gateway/response/r1", "gateway/#"));
    /// assert!(!matcher.matches("gateway/request", "gateway/response"));
    /// ```
    pub fn matches(&self, topic: &str, filter: &str) -> bool {
        if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
            return false;
        }

        let mut topic_levels = topic.split('/');
        let mut filter_levels = filter.split('/').peekable();

        while let Some(f_level) = filter_levels.next() {
            if f_level == "#" {
                return filter_levels.peek().is_none();
            }
            match topic_levels.next() {
                Some(t_level) if f_level == "+" || f_level == t_level => {}
                _ => return false,
            }
        }

        topic_levels.next().is_none()
    }

    /// Check if a subscription filter is well formed
    pub fn is_valid_filter(&self, filter: &str) -> bool {
        if filter.is_empty() {
            return false;
        }

        let level_count = filter.split('/').count();
        filter.split('/').enumerate().all(|(i, level)| match level {
            "#" => i + 1 == level_count,
            "+" => true,
            _ => !level.contains('#') && !level.contains('+'),
        })
    }

    /// Check if a publish topic name is well formed (no wildcards)
    pub fn is_valid_topic(&self, topic: &str) -> bool {
        !topic.is_empty() && !topic.contains('#') && !topic.contains('+')
    }
}
