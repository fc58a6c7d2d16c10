//! Partition keys.
//!
//! A task's group becomes the FIFO message group of its queue message, so
//! at most one message per group is in flight at a time. Groups bound
//! concurrency per tenant or category; they do not order anything.
//! Group prefixes also decide which consumers take a message (see
//! [`is_eligible`]).

use std::fmt;

/// Prefix for groups derived from an entity identity.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Consumer setting meaning "handle every group".
pub const ALL_GROUP: &str = "TASK_ALL";

/// Shared bucket for work with no owning entity.
pub const SYSTEM_GROUP: &str = "DEFAULT_SYSTEM";

/// Anything that can own a partition of work, typically a tenant.
pub trait Partitioned {
    /// Stable identity; must not change over the entity's lifetime.
    fn partition_identity(&self) -> String;
}

/// How a task's partition key is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TaskGroup {
    /// Derived from an entity: `DEFAULT_<identity>`.
    Keyed(String),
    /// Caller-given key used verbatim, defining its own prefix.
    Named(String),
    /// No owner.
    #[default]
    System,
}

impl TaskGroup {
    pub fn keyed<P: Partitioned + ?Sized>(owner: &P) -> Self {
        TaskGroup::Keyed(owner.partition_identity())
    }

    pub fn named(name: impl Into<String>) -> Self {
        TaskGroup::Named(name.into())
    }

    pub fn partition_key(&self) -> String {
        match self {
            TaskGroup::Keyed(identity) => format!("{DEFAULT_GROUP}_{identity}"),
            TaskGroup::Named(name) if name.is_empty() => SYSTEM_GROUP.to_string(),
            TaskGroup::Named(name) => name.clone(),
            TaskGroup::System => SYSTEM_GROUP.to_string(),
        }
    }
}

impl From<&str> for TaskGroup {
    fn from(name: &str) -> Self {
        TaskGroup::Named(name.to_string())
    }
}

impl From<String> for TaskGroup {
    fn from(name: String) -> Self {
        TaskGroup::Named(name)
    }
}

impl fmt::Display for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.partition_key())
    }
}

/// Whether a consumer configured for `task_groups` takes a message in `group`.
///
/// An empty list, or one containing [`ALL_GROUP`], accepts everything.
/// Otherwise the message group must start with one of the listed prefixes.
pub fn is_eligible(group: Option<&str>, task_groups: &[String]) -> bool {
    if task_groups.is_empty() || task_groups.iter().any(|g| g == ALL_GROUP) {
        return true;
    }
    match group {
        Some(group) => task_groups.iter().any(|prefix| group.starts_with(prefix.as_str())),
        None => false,
    }
}
