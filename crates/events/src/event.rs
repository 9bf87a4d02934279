use chrono::{DateTime, Utc};

/// A domain-agnostic event trait for event-sourced aggregates.
///
/// Events represent **facts that happened** in the domain: immutable,
/// versioned, append-only. State is rebuilt by replaying them in order, and
/// read models are built by projecting them.
///
/// Events must be serializable (JSON storage/transport), cloneable (copied
/// into aggregates and projections), `Send + Sync + 'static` (they cross
/// worker boundaries).
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "extraction.entity.extracted").
    ///
    /// Used for routing, projection dispatch and schema lookups. Convention:
    /// `{module}.{aggregate}.{action}`. Never change an identifier once
    /// events with it have been persisted.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    ///
    /// Increment when the payload structure changes; deserialization must
    /// keep handling old versions until they are migrated out.
    fn version(&self) -> u32;

    /// When the event occurred (business time, not persistence time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
