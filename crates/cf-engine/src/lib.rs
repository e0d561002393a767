//! Content filter engine
//!
//! Runtime half of the filter: the [`RuleManager`] keeps sources and
//! exception lists and publishes rebuilt indices, [`TabState`] tracks what
//! each tab blocked and its ad attribution, and the [`StatsStore`] keeps
//! durable counters. [`ContentFilter`] drives all of them for a host.

pub mod attribution;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod stats;
pub mod subscribers;
pub mod tab_state;
pub mod throttle;

pub use attribution::{AdAttribution, AttributionState};
pub use config::{
    EngineConfig, ExceptionsList, FilterSettings, GroupConfig, PresetKind, PresetSource, SourceConfig, SourceSettings,
    TimingConfig, PRESET_SOURCES,
};
pub use engine::{ContentFilter, FilterEvent, RequestEvaluator, RequestOutcome, SourceManagement, TabStateAccess};
pub use error::EngineError;
pub use manager::{IndexSlot, ManagerEvent, RebuildOutcome, RebuildTask, RuleManager};
pub use stats::{EntryType, InitStatus, StatsData, StatsEntry, StatsError, StatsStore};
pub use subscribers::{SubscriberRegistry, SubscriptionId};
pub use tab_state::{NavigationCause, RuleData, TabActivations, TabBlockedUrls, TabId, TabState};
pub use throttle::{NotificationBurst, NotificationThrottle};
