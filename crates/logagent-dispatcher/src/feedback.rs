//! Drops (or tags, or warns about) records the agent emitted about itself,
//! so a log shipper watching its own log file doesn't amplify itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackAction {
    Drop,
    Tag,
    Warn,
}

impl Default for FeedbackAction {
    fn default() -> Self {
        FeedbackAction::Drop
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackGuardConfig {
    pub action: FeedbackAction,
    pub self_identifiers: Vec<String>,
    pub self_container_name: Option<String>,
    pub self_log_prefix: Option<String>,
    pub self_path_pattern: Option<String>,
}

/// What `FeedbackGuard::check` decided to do with a candidate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackDecision {
    /// Not self-emitted; pass through unchanged.
    Pass,
    /// Self-emitted and the configured action is `tag`: pass through, but
    /// the caller should attach `self_log=true`.
    Tag,
    /// Self-emitted and the configured action is `warn`: pass through (a
    /// warning was logged, rate-limited to once per minute).
    Warn,
    /// Self-emitted and the configured action is `drop`.
    Drop,
}

pub struct FeedbackGuard {
    action: FeedbackAction,
    self_identifiers: Vec<String>,
    self_container_name: Option<String>,
    self_log_prefix: Option<String>,
    self_path_pattern: Option<Regex>,
    last_warned_at_epoch_secs: AtomicI64,
}

impl FeedbackGuard {
    pub fn new(config: FeedbackGuardConfig) -> anyhow::Result<Self> {
        let self_path_pattern = config
            .self_path_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self {
            action: config.action,
            self_identifiers: config.self_identifiers,
            self_container_name: config.self_container_name,
            self_log_prefix: config.self_log_prefix,
            self_path_pattern,
            last_warned_at_epoch_secs: AtomicI64::new(0),
        })
    }

    /// Any-match predicate: source id contains a self-identifier, the
    /// `container_name` label equals the configured self name, the
    /// message starts with the self-log prefix, or `source_id` matches
    /// the self-path regex (source ids for file sources are paths).
    fn looks_self_emitted(&self, source_id: &str, message: &str, labels: &HashMap<String, String>) -> bool {
        if self
            .self_identifiers
            .iter()
            .any(|id| !id.is_empty() && source_id.contains(id.as_str()))
        {
            return true;
        }
        if let Some(self_name) = &self.self_container_name {
            if labels.get("container_name").map(|v| v == self_name).unwrap_or(false) {
                return true;
            }
        }
        if let Some(prefix) = &self.self_log_prefix {
            if !prefix.is_empty() && message.starts_with(prefix.as_str()) {
                return true;
            }
        }
        if let Some(pattern) = &self.self_path_pattern {
            if pattern.is_match(source_id) {
                return true;
            }
        }
        false
    }

    pub fn check(&self, source_id: &str, message: &str, labels: &HashMap<String, String>, now_epoch_secs: i64) -> FeedbackDecision {
        if !self.looks_self_emitted(source_id, message, labels) {
            return FeedbackDecision::Pass;
        }

        match self.action {
            FeedbackAction::Drop => FeedbackDecision::Drop,
            FeedbackAction::Tag => FeedbackDecision::Tag,
            FeedbackAction::Warn => {
                let last = self.last_warned_at_epoch_secs.load(Ordering::Relaxed);
                if now_epoch_secs - last >= 60 {
                    self.last_warned_at_epoch_secs.store(now_epoch_secs, Ordering::Relaxed);
                    warn!(source_id, "passing through a record that looks self-emitted");
                }
                FeedbackDecision::Warn
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(action: FeedbackAction) -> FeedbackGuard {
        FeedbackGuard::new(FeedbackGuardConfig {
            action,
            self_identifiers: vec!["logagent".to_string()],
            self_container_name: Some("logagent-self".to_string()),
            self_log_prefix: Some("[logagent]".to_string()),
            self_path_pattern: Some(r"/var/log/logagent/.*".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn matches_on_source_id_substring() {
        let g = guard(FeedbackAction::Drop);
        assert_eq!(
            g.check("/var/log/logagent-agent.log", "hi", &HashMap::new(), 0),
            FeedbackDecision::Drop
        );
    }

    #[test]
    fn matches_on_container_name_label() {
        let g = guard(FeedbackAction::Drop);
        let mut labels = HashMap::new();
        labels.insert("container_name".to_string(), "logagent-self".to_string());
        assert_eq!(g.check("/a", "hi", &labels, 0), FeedbackDecision::Drop);
    }

    #[test]
    fn matches_on_message_prefix() {
        let g = guard(FeedbackAction::Drop);
        assert_eq!(
            g.check("/a", "[logagent] starting up", &HashMap::new(), 0),
            FeedbackDecision::Drop
        );
    }

    #[test]
    fn matches_on_path_pattern() {
        let g = guard(FeedbackAction::Drop);
        assert_eq!(
            g.check("/var/log/logagent/out.log", "hi", &HashMap::new(), 0),
            FeedbackDecision::Drop
        );
    }

    #[test]
    fn unrelated_record_passes() {
        let g = guard(FeedbackAction::Drop);
        assert_eq!(g.check("/var/log/app.log", "hello", &HashMap::new(), 0), FeedbackDecision::Pass);
    }

    #[test]
    fn tag_action_returns_tag_not_drop() {
        let g = guard(FeedbackAction::Tag);
        assert_eq!(
            g.check("/var/log/logagent-agent.log", "hi", &HashMap::new(), 0),
            FeedbackDecision::Tag
        );
    }

    #[test]
    fn warn_action_rate_limits_the_log_line_not_the_decision() {
        let g = guard(FeedbackAction::Warn);
        assert_eq!(
            g.check("/var/log/logagent-agent.log", "hi", &HashMap::new(), 0),
            FeedbackDecision::Warn
        );
        assert_eq!(
            g.check("/var/log/logagent-agent.log", "hi", &HashMap::new(), 30),
            FeedbackDecision::Warn,
            "still warn-classified even though the log line itself is suppressed"
        );
    }
}
