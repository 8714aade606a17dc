//! Minimal robots.txt support and a TTL cache keyed by origin.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RobotsRule {
    allow: bool,
    path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RobotsGroup {
    agents: Vec<String>,
    rules: Vec<RobotsRule>,
}

/// Parsed `User-agent` groups with their `Allow`/`Disallow` prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    groups: Vec<RobotsGroup>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn parse(body: &str) -> Self {
        let mut groups = Vec::new();
        let mut current: Option<RobotsGroup> = None;
        let mut last_was_agent = false;

        for raw_line in body.lines() {
            let line = raw_line.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !last_was_agent {
                        if let Some(group) = current.take() {
                            groups.push(group);
                        }
                        current = Some(RobotsGroup::default());
                    }
                    if let Some(group) = current.as_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                    last_was_agent = true;
                }
                "allow" | "disallow" => {
                    if let Some(group) = current.as_mut() {
                        // An empty Disallow means "allow everything" and adds no rule.
                        if !value.is_empty() {
                            group.rules.push(RobotsRule {
                                allow: key == "allow",
                                path: value.to_string(),
                            });
                        }
                    }
                    last_was_agent = false;
                }
                _ => last_was_agent = false,
            }
        }
        if let Some(group) = current {
            groups.push(group);
        }

        Self { groups }
    }

    /// Longest matching prefix wins; `Allow` wins ties.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        let specific: Vec<&RobotsGroup> = self
            .groups
            .iter()
            .filter(|g| g.agents.iter().any(|a| a != "*" && !a.is_empty() && ua.contains(a.as_str())))
            .collect();
        let applicable = if specific.is_empty() {
            self.groups
                .iter()
                .filter(|g| g.agents.iter().any(|a| a == "*"))
                .collect()
        } else {
            specific
        };

        let mut best: Option<(usize, bool)> = None;
        for rule in applicable.iter().flat_map(|g| g.rules.iter()) {
            if !path.starts_with(rule.path.as_str()) {
                continue;
            }
            let len = rule.path.len();
            let better = match best {
                None => true,
                Some((best_len, best_allow)) => len > best_len || (len == best_len && rule.allow && !best_allow),
            };
            if better {
                best = Some((len, rule.allow));
            }
        }
        best.map_or(true, |(_, allow)| allow)
    }
}

#[derive(Debug, Clone)]
struct CachedRobots {
    rules: Arc<RobotsRules>,
    expires_at: Instant,
}

/// Shared robots cache. Missing or unreachable files are cached as allow-all
/// for the shorter negative TTL.
#[derive(Debug)]
pub struct RobotsCache {
    ttl: Duration,
    negative_ttl: Duration,
    entries: Mutex<HashMap<String, CachedRobots>>,
}

impl RobotsCache {
    pub fn new(ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            ttl,
            negative_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, origin: &str) -> Option<Arc<RobotsRules>> {
        let mut entries = self.entries.lock().await;
        match entries.get(origin) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.rules.clone()),
            Some(_) => {
                entries.remove(origin);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, origin: &str, rules: Arc<RobotsRules>) {
        self.put(origin, rules, self.ttl).await;
    }

    pub async fn insert_missing(&self, origin: &str) -> Arc<RobotsRules> {
        let rules = Arc::new(RobotsRules::allow_all());
        self.put(origin, rules.clone(), self.negative_ttl).await;
        rules
    }

    async fn put(&self, origin: &str, rules: Arc<RobotsRules>, ttl: Duration) {
        self.entries.lock().await.insert(
            origin.to_string(),
            CachedRobots {
                rules,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# comment
User-agent: *
Disallow: /private
Allow: /private/press

User-agent: rip-research-bot
User-agent: other-bot
Disallow: /bots-only
Disallow:
";

    #[test]
    fn wildcard_group_applies_to_unknown_agents() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(!rules.is_allowed("curl/8.0", "/private/report"));
        assert!(rules.is_allowed("curl/8.0", "/private/press/2024"));
        assert!(rules.is_allowed("curl/8.0", "/bots-only"));
    }

    #[test]
    fn specific_group_replaces_wildcard_group() {
        let rules = RobotsRules::parse(ROBOTS);
        assert!(!rules.is_allowed("rip-research-bot/0.1", "/bots-only/x"));
        assert!(rules.is_allowed("rip-research-bot/0.1", "/private/report"));
    }

    #[test]
    fn disallow_root_blocks_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /\n");
        assert!(!rules.is_allowed("any", "/"));
        assert!(!rules.is_allowed("any", "/index.html"));
        assert!(RobotsRules::allow_all().is_allowed("any", "/index.html"));
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let cache = RobotsCache::new(Duration::from_millis(20), Duration::from_millis(5));
        cache.insert("http://a", Arc::new(RobotsRules::allow_all())).await;
        cache.insert_missing("http://b").await;
        assert!(cache.get("http://a").await.is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("http://b").await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("http://a").await.is_none());
    }
}
