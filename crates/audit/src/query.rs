use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::level::AuditLevel;
use crate::log::AuditLog;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Zero-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    /// Clamps `size` to `1..=MAX_PAGE_SIZE`.
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self {
            items,
            page: request.page,
            size: request.size,
            total,
        }
    }

    pub fn total_pages(&self) -> u64 {
        self.total.div_ceil(u64::from(self.size.max(1)))
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total: self.total,
        }
    }
}

/// Filters for [`AuditRepository::search`](crate::AuditRepository::search).
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditCriteria {
    pub event_type: Option<String>,
    pub service_name: Option<String>,
    pub level: Option<AuditLevel>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub compliance_only: bool,
}

impl AuditCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Restricts to `[from, to)`.
    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn compliance_only(mut self) -> Self {
        self.compliance_only = true;
        self
    }

    pub fn matches(&self, log: &AuditLog) -> bool {
        self.event_type.as_ref().is_none_or(|t| *t == log.event_type)
            && self.service_name.as_ref().is_none_or(|s| *s == log.service_name)
            && self.level.is_none_or(|l| l == log.level)
            && self.from.is_none_or(|from| log.timestamp >= from)
            && self.to.is_none_or(|to| log.timestamp < to)
            && (!self.compliance_only || log.requires_compliance_tracking)
    }
}

/// Row counts of the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub total: u64,
    pub by_event_type: BTreeMap<String, u64>,
    pub by_service: BTreeMap<String, u64>,
    pub by_level: BTreeMap<AuditLevel, u64>,
}

impl AuditStatistics {
    pub fn from_logs<'a>(logs: impl IntoIterator<Item = &'a AuditLog>) -> Self {
        let mut stats = Self::default();
        for log in logs {
            stats.total += 1;
            *stats.by_event_type.entry(log.event_type.clone()).or_default() += 1;
            *stats.by_service.entry(log.service_name.clone()).or_default() += 1;
            *stats.by_level.entry(log.level).or_default() += 1;
        }
        stats
    }

    pub fn count_at(&self, level: AuditLevel) -> u64 {
        self.by_level.get(&level).copied().unwrap_or(0)
    }
}

/// Orders a correlation trace so every event follows the event that caused
/// it. Ties keep timestamp order; events whose cause is not in the trace
/// count as roots.
pub fn causal_order(mut logs: Vec<AuditLog>) -> Vec<AuditLog> {
    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

    let present: HashSet<EventId> = logs.iter().map(|l| l.event_id).collect();
    let mut children: HashMap<EventId, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (index, log) in logs.iter().enumerate() {
        match log.causation_id.filter(|cause| present.contains(cause) && *cause != log.event_id) {
            Some(cause) => children.entry(cause).or_default().push(index),
            None => roots.push(index),
        }
    }

    let mut ordered = Vec::with_capacity(logs.len());
    let mut emitted = vec![false; logs.len()];
    // Depth-first walk; the stack holds indices in reverse so the earliest
    // sibling comes out first.
    let mut stack: Vec<usize> = roots.into_iter().rev().collect();
    while let Some(index) = stack.pop() {
        if std::mem::replace(&mut emitted[index], true) {
            continue;
        }
        ordered.push(index);
        if let Some(next) = children.get(&logs[index].event_id) {
            stack.extend(next.iter().rev());
        }
    }
    // Cycles have no root; append them in timestamp order.
    ordered.extend((0..logs.len()).filter(|i| !emitted[*i]));

    let mut slots: Vec<Option<AuditLog>> = logs.into_iter().map(Some).collect();
    ordered
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}
