//! Priority taxonomy.
//!
//! Seven priority codes collapse onto three durable queues and two
//! execution contracts. Every valid combination is a variant here, so
//! routing never looks anything up by string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Durable queue a priority is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueTier {
    High,
    Med,
    Low,
}

impl QueueTier {
    pub const ALL: [QueueTier; 3] = [QueueTier::High, QueueTier::Med, QueueTier::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueTier::High => "HIGH",
            QueueTier::Med => "MED",
            QueueTier::Low => "LOW",
        }
    }

    /// Spool folder number; lower drains first.
    pub fn spool_level(&self) -> u8 {
        match self {
            QueueTier::High => 1,
            QueueTier::Med => 2,
            QueueTier::Low => 3,
        }
    }

    pub fn from_spool_level(level: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.spool_level() == level)
    }
}

impl fmt::Display for QueueTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Ok(QueueTier::High),
            "MED" => Ok(QueueTier::Med),
            "LOW" => Ok(QueueTier::Low),
            other => Err(format!("unknown queue tier '{other}'")),
        }
    }
}

/// Where a received task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Awaited by the receiver (poller or sender) before it moves on.
    Inline,
    /// Handed to the local spooler.
    Spooled,
}

/// When the durable-queue message is deleted relative to execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTiming {
    /// Deleted on receipt. The partition is released immediately but
    /// execution is not guaranteed.
    BeforeExecution,
    /// Deleted once local execution finishes without asking for a retry.
    AfterExecution,
}

/// Task priority, serialized as its short code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "HI")]
    HighInline,
    #[serde(rename = "HS")]
    HighSpooled,
    #[serde(rename = "HSU")]
    HighSpooledUnsafe,
    #[serde(rename = "MI")]
    MedInline,
    #[default]
    #[serde(rename = "MS")]
    MedSpooled,
    #[serde(rename = "MSU")]
    MedSpooledUnsafe,
    #[serde(rename = "LS")]
    LowSpooled,
}

impl Priority {
    pub const ALL: [Priority; 7] = [
        Priority::HighInline,
        Priority::HighSpooled,
        Priority::HighSpooledUnsafe,
        Priority::MedInline,
        Priority::MedSpooled,
        Priority::MedSpooledUnsafe,
        Priority::LowSpooled,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Priority::HighInline => "HI",
            Priority::HighSpooled => "HS",
            Priority::HighSpooledUnsafe => "HSU",
            Priority::MedInline => "MI",
            Priority::MedSpooled => "MS",
            Priority::MedSpooledUnsafe => "MSU",
            Priority::LowSpooled => "LS",
        }
    }

    pub fn tier(&self) -> QueueTier {
        match self {
            Priority::HighInline | Priority::HighSpooled | Priority::HighSpooledUnsafe => {
                QueueTier::High
            }
            Priority::MedInline | Priority::MedSpooled | Priority::MedSpooledUnsafe => {
                QueueTier::Med
            }
            Priority::LowSpooled => QueueTier::Low,
        }
    }

    pub fn execution(&self) -> ExecutionMode {
        match self {
            Priority::HighInline | Priority::MedInline => ExecutionMode::Inline,
            _ => ExecutionMode::Spooled,
        }
    }

    pub fn delete_timing(&self) -> DeleteTiming {
        match self {
            Priority::HighSpooled | Priority::MedSpooled | Priority::LowSpooled => {
                DeleteTiming::AfterExecution
            }
            _ => DeleteTiming::BeforeExecution,
        }
    }

    pub fn spool_level(&self) -> u8 {
        self.tier().spool_level()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown priority code '{s}'"))
    }
}
