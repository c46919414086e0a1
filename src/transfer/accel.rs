//! Size-threshold acceleration
//!
//! Large products are routed to a different provider by rewriting the scheme
//! used for dispatch. The message itself is never changed: the remote URL the
//! provider receives keeps its original scheme, so nothing downstream can
//! tell acceleration happened.

use std::collections::HashMap;

use crate::message::Message;

/// Scheme rewrite applied before provider dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct AccelPolicy {
    threshold: Option<u64>,
    rewrite: HashMap<String, String>,
}

impl Default for AccelPolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AccelPolicy {
    /// Policy with the default rewrites (`http`→`download`,
    /// `https`→`downloads`). A `None` threshold disables acceleration.
    pub fn new(threshold: Option<u64>) -> Self {
        let rewrite = [("http", "download"), ("https", "downloads")]
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        Self { threshold, rewrite }
    }

    /// Add or replace the alternate scheme for `from`
    pub fn with_rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite
            .insert(from.into().to_ascii_lowercase(), to.into().to_ascii_lowercase());
        self
    }

    pub fn threshold(&self) -> Option<u64> {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold.is_some()
    }

    /// Alternate scheme configured for `scheme`
    pub fn alternate(&self, scheme: &str) -> Option<&str> {
        self.rewrite
            .get(&scheme.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Scheme to dispatch `message` on, given its current `scheme`
    pub fn dispatch_scheme<'a>(&'a self, message: &Message, scheme: &'a str) -> &'a str {
        let Some(threshold) = self.threshold else {
            return scheme;
        };
        match (message.declared_size(), self.alternate(scheme)) {
            (Some(size), Some(alternate)) if size >= threshold => alternate,
            _ => scheme,
        }
    }
}
