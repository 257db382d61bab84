//! Category → TTL table and the reload-durability allow-list.

use chrono::Duration;
use std::collections::HashMap;

/// Expiry and durability rules for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryPolicy {
  pub ttl: Duration,
  /// Mirror entries of this category to local storage
  pub persist: bool,
}

/// Static per-category cache policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  categories: HashMap<String, CategoryPolicy>,
  default_ttl: Duration,
}

impl CachePolicy {
  /// An empty table where every category gets `default_ttl` and nothing persists.
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      categories: HashMap::new(),
      default_ttl,
    }
  }

  /// Add or replace the rule for `category`.
  pub fn with_category(mut self, category: &str, ttl: Duration, persist: bool) -> Self {
    self
      .categories
      .insert(category.to_string(), CategoryPolicy { ttl, persist });
    self
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// TTL for `category`, falling back to the default for unknown categories.
  pub fn ttl_for(&self, category: &str) -> Duration {
    self
      .categories
      .get(category)
      .map_or(self.default_ttl, |p| p.ttl)
  }

  /// Whether entries of `category` must survive a restart.
  pub fn persists(&self, category: &str) -> bool {
    self.categories.get(category).is_some_and(|p| p.persist)
  }

  pub fn get(&self, category: &str) -> Option<CategoryPolicy> {
    self.categories.get(category).copied()
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }
}

impl Default for CachePolicy {
  /// The dashboard's built-in table.
  fn default() -> Self {
    Self::new(Duration::minutes(5))
      .with_category("profile", Duration::minutes(30), true)
      .with_category("team", Duration::minutes(10), true)
      .with_category("gamification", Duration::minutes(5), true)
      .with_category("planning", Duration::minutes(15), true)
      .with_category("quests", Duration::minutes(5), false)
      .with_category("chat", Duration::minutes(1), false)
  }
}
