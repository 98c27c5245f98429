//! Subscription filters: composable async predicates over events.
//!
//! Every filter implements [`EventFilter`]. The trait returns a boxed future
//! so filters stay object-safe and can be stored as `Arc<dyn EventFilter>`
//! inside subscriptions and composites.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use regex::Regex;
use switchboard_types::event::{Event, EventPriority, EventType};

/// Decides whether a subscription receives an event.
pub trait EventFilter: Send + Sync {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool>;
}

// ---------------------------------------------------------------------------
// Field filters
// ---------------------------------------------------------------------------

/// Matches events whose type is in the set.
#[derive(Debug, Clone)]
pub struct TypeFilter {
    types: HashSet<EventType>,
}

impl TypeFilter {
    pub fn new(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }
}

impl EventFilter for TypeFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        ready(self.types.contains(&event.event_type())).boxed()
    }
}

/// Matches events whose `event_name` is exactly one of the names.
#[derive(Debug, Clone)]
pub struct NameFilter {
    names: HashSet<String>,
}

impl NameFilter {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventFilter for NameFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        ready(self.names.contains(event.name())).boxed()
    }
}

/// Matches events whose `event_name` matches any of the patterns.
///
/// Patterns are unanchored, as with `Regex::is_match`.
#[derive(Debug, Clone)]
pub struct NamePatternFilter {
    patterns: Vec<Regex>,
}

impl NamePatternFilter {
    pub fn new<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Result<Self, regex::Error> {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }
}

impl EventFilter for NamePatternFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        let name = event.name();
        ready(self.patterns.iter().any(|re| re.is_match(name))).boxed()
    }
}

/// Matches events published by one of the sources.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    sources: HashSet<String>,
}

impl SourceFilter {
    pub fn new<S: Into<String>>(sources: impl IntoIterator<Item = S>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventFilter for SourceFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        ready(self.sources.contains(event.source())).boxed()
    }
}

/// Matches events addressed to one of the targets. Untargeted events never match.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    targets: HashSet<String>,
}

impl TargetFilter {
    pub fn new<S: Into<String>>(targets: impl IntoIterator<Item = S>) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventFilter for TargetFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        let hit = event.target().is_some_and(|t| self.targets.contains(t));
        ready(hit).boxed()
    }
}

/// Matches events at or above a minimum priority.
#[derive(Debug, Clone, Copy)]
pub struct PriorityFilter {
    min_priority: EventPriority,
}

impl PriorityFilter {
    pub fn new(min_priority: EventPriority) -> Self {
        Self { min_priority }
    }
}

impl EventFilter for PriorityFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        ready(event.priority().value() >= self.min_priority.value()).boxed()
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// AND (`require_all`) or OR over child filters. An empty composite matches everything.
#[derive(Clone)]
pub struct CompositeFilter {
    filters: Vec<Arc<dyn EventFilter>>,
    require_all: bool,
}

impl CompositeFilter {
    pub fn new(filters: Vec<Arc<dyn EventFilter>>, require_all: bool) -> Self {
        Self {
            filters,
            require_all,
        }
    }

    /// Empty AND composite; add children with [`CompositeFilter::with`].
    pub fn all() -> Self {
        Self::new(Vec::new(), true)
    }

    /// Empty OR composite.
    pub fn any() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn with(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl EventFilter for CompositeFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        async move {
            if self.filters.is_empty() {
                return true;
            }
            // Short-circuits in both modes.
            for filter in &self.filters {
                let hit = filter.matches(event).await;
                if self.require_all && !hit {
                    return false;
                }
                if !self.require_all && hit {
                    return true;
                }
            }
            self.require_all
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Custom predicates
// ---------------------------------------------------------------------------

type SyncPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;
type AsyncPredicate = Arc<dyn Fn(Event) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Clone)]
enum Predicate {
    Sync(SyncPredicate),
    Async(AsyncPredicate),
}

/// Escape hatch for arbitrary matching logic.
#[derive(Clone)]
pub struct CustomFilter {
    predicate: Predicate,
}

impl CustomFilter {
    /// Wrap a plain boolean predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Predicate::Sync(Arc::new(predicate)),
        }
    }

    /// Wrap an async predicate. It receives its own copy of the event.
    pub fn from_async<F>(predicate: F) -> Self
    where
        F: Fn(Event) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        Self {
            predicate: Predicate::Async(Arc::new(predicate)),
        }
    }
}

impl EventFilter for CustomFilter {
    fn matches<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, bool> {
        match &self.predicate {
            Predicate::Sync(f) => ready(f(event)).boxed(),
            Predicate::Async(f) => f(event.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn query(name: &str) -> Event {
        Event::query(name, Map::new()).with_source("pricing")
    }

    #[tokio::test]
    async fn type_filter_matches_listed_types_only() {
        let filter = TypeFilter::new([EventType::Query, EventType::Response]);
        assert!(filter.matches(&query("price")).await);
        assert!(!filter.matches(&Event::command("c", Map::new())).await);
    }

    #[tokio::test]
    async fn name_filter_is_exact() {
        let filter = NameFilter::new(["price"]);
        assert!(filter.matches(&query("price")).await);
        assert!(!filter.matches(&query("price_history")).await);
    }

    #[tokio::test]
    async fn name_pattern_filter_ors_patterns() {
        let filter = NamePatternFilter::new(["^order_", "_failed$"]).unwrap();
        assert!(filter.matches(&query("order_created")).await);
        assert!(filter.matches(&query("sync_failed")).await);
        assert!(!filter.matches(&query("price")).await);
    }

    #[test]
    fn name_pattern_filter_rejects_invalid_regex() {
        assert!(NamePatternFilter::new(["("]).is_err());
    }

    #[tokio::test]
    async fn source_filter_matches_source() {
        let filter = SourceFilter::new(["pricing"]);
        assert!(filter.matches(&query("price")).await);
        assert!(!filter.matches(&query("price").with_source("inventory")).await);
    }

    #[tokio::test]
    async fn target_filter_never_matches_untargeted() {
        let filter = TargetFilter::new(["agent-b"]);
        assert!(!filter.matches(&query("price")).await);
        assert!(filter.matches(&query("price").with_target("agent-b")).await);
        assert!(!filter.matches(&query("price").with_target("agent-c")).await);
    }

    #[tokio::test]
    async fn priority_filter_is_inclusive_minimum() {
        let filter = PriorityFilter::new(EventPriority::High);
        assert!(filter.matches(&query("p").with_priority(EventPriority::High)).await);
        assert!(filter.matches(&query("p").with_priority(EventPriority::Critical)).await);
        assert!(!filter.matches(&query("p")).await);
    }

    #[tokio::test]
    async fn composite_and_or_semantics() {
        let and = CompositeFilter::all()
            .with(TypeFilter::new([EventType::Query]))
            .with(NameFilter::new(["price"]));
        assert!(and.matches(&query("price")).await);
        assert!(!and.matches(&query("stock")).await);

        let or = CompositeFilter::any()
            .with(NameFilter::new(["price"]))
            .with(NameFilter::new(["stock"]));
        assert!(or.matches(&query("stock")).await);
        assert!(!or.matches(&query("other")).await);
    }

    #[tokio::test]
    async fn empty_composite_matches_everything() {
        assert!(CompositeFilter::all().matches(&query("x")).await);
        assert!(CompositeFilter::any().matches(&query("x")).await);
    }

    #[tokio::test]
    async fn custom_filters_sync_and_async() {
        let sync = CustomFilter::new(|e| e.name().starts_with("pr"));
        assert!(sync.matches(&query("price")).await);

        let asynchronous = CustomFilter::from_async(|e| {
            async move { e.source() == "pricing" }.boxed()
        });
        assert!(asynchronous.matches(&query("price")).await);
        assert!(!asynchronous.matches(&query("price").with_source("x")).await);
    }
}
