//! In-memory outcome sink.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::admission_pool::{OutcomeSink, UnitReport};
use crate::util::clock::now_ms;

/// A delivered report with its arrival time.
#[derive(Debug, Clone)]
pub struct DeliveredReport {
    /// The report.
    pub report: UnitReport,
    /// Timestamp milliseconds.
    pub delivered_at_ms: u128,
}

/// Keeps every report, indexed by unit id. For development and tests.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeSink {
    reports: Mutex<Vec<DeliveredReport>>,
    by_unit: Mutex<HashMap<Uuid, usize>>,
}

impl InMemoryOutcomeSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports in delivery order.
    #[must_use]
    pub fn reports(&self) -> Vec<UnitReport> {
        self.reports.lock().iter().map(|d| d.report.clone()).collect()
    }

    /// Reports delivered at or after `since_ms`, at most `limit` of them.
    #[must_use]
    pub fn fetch(&self, since_ms: Option<u128>, limit: usize) -> Vec<DeliveredReport> {
        self.reports
            .lock()
            .iter()
            .filter(|d| since_ms.is_none_or(|s| d.delivered_at_ms >= s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The report for one unit, if delivered.
    #[must_use]
    pub fn report_for(&self, unit_id: Uuid) -> Option<UnitReport> {
        let idx = *self.by_unit.lock().get(&unit_id)?;
        self.reports.lock().get(idx).map(|d| d.report.clone())
    }

    /// Number of reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// True when nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl OutcomeSink for InMemoryOutcomeSink {
    fn deliver(&self, report: UnitReport) {
        let unit_id = report.unit.id;
        let mut reports = self.reports.lock();
        reports.push(DeliveredReport {
            report,
            delivered_at_ms: now_ms(),
        });
        self.by_unit.lock().insert(unit_id, reports.len() - 1);
    }
}
