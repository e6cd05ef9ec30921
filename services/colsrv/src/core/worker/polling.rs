//! Polling groups and group scheduling
//!
//! A polling group is a batch of data points read together in one protocol
//! operation, with its own interval. The schedule decides per tick which
//! groups are due, in registration order; there is no priority weighting in
//! the base design.
//!
//! The whole group set sits behind a single lock. Workers sharing a
//! physical medium (an RS-485 bus, typically) additionally hold a
//! [`BusLock`] for the duration of one group read so that two logical slave
//! workers never talk over each other on the wire.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::DataPoint;
use crate::error::{ColSrvError, Result};

/// Mutual-exclusion guard over a shared physical medium.
///
/// Held only for the duration of a single group read or write; the lock
/// serializes access, it never propagates faults between holders.
pub type BusLock = Arc<tokio::sync::Mutex<()>>;

/// Create a bus lock to be shared by every worker on one physical medium.
pub fn new_bus_lock() -> BusLock {
    Arc::new(tokio::sync::Mutex::new(()))
}

/// Protocol-specific addressing of a polling group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupAddress {
    /// Contiguous register range (Modbus and friends)
    Registers {
        register_type: String,
        start: u16,
        count: u16,
    },
    /// Topic or object filter (MQTT, BACnet COV, ...)
    Topic { filter: String },
    /// Protocol addresses purely per-point
    #[default]
    PerPoint,
}

/// One polling group. Mutated only by the schedule updating its poll
/// timestamps; configuration fields are fixed at creation.
#[derive(Debug, Clone)]
pub struct PollingGroup {
    pub id: u32,
    pub name: String,
    pub address: GroupAddress,
    pub interval: Duration,
    pub enabled: bool,
    pub points: Vec<DataPoint>,
    /// Cumulative failed reads; failures never disable the group
    pub failure_count: u64,
    pub last_poll: Option<Instant>,
    pub next_poll: Instant,
}

/// A due group as handed to the poll loop: enough to issue one batched read
/// without holding the schedule lock across I/O.
#[derive(Debug, Clone)]
pub struct DueGroup {
    pub id: u32,
    pub name: String,
    pub points: Vec<DataPoint>,
}

/// The set of polling groups belonging to one device worker.
pub struct PollingSchedule {
    groups: RwLock<Vec<PollingGroup>>,
    next_id: AtomicU32,
}

impl Default for PollingSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingSchedule {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Add a group covering `points`. The group is due immediately.
    ///
    /// Rejects an empty interval and points already covered by another
    /// group (a point belongs to exactly one group at a time).
    pub fn add_group(
        &self,
        name: impl Into<String>,
        address: GroupAddress,
        interval: Duration,
        points: Vec<DataPoint>,
    ) -> Result<u32> {
        if interval.is_zero() {
            return Err(ColSrvError::validation("polling interval must be non-zero"));
        }

        let mut groups = self.groups.write();
        for point in &points {
            if groups.iter().any(|g| g.points.iter().any(|p| p.id == point.id)) {
                return Err(ColSrvError::validation(format!(
                    "point '{}' already belongs to a polling group",
                    point.id
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        groups.push(PollingGroup {
            id,
            name: name.into(),
            address,
            interval,
            enabled: true,
            points,
            failure_count: 0,
            last_poll: None,
            next_poll: Instant::now(),
        });
        Ok(id)
    }

    /// Remove a group. Its points become free for regrouping.
    pub fn remove_group(&self, id: u32) -> bool {
        let mut groups = self.groups.write();
        let before = groups.len();
        groups.retain(|g| g.id != id);
        groups.len() != before
    }

    /// Enable or disable a group without deleting its configuration.
    /// Disabled groups leave the due-set; re-enabling makes the group due
    /// again from "now".
    pub fn set_group_enabled(&self, id: u32, enabled: bool) -> bool {
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.id == id) {
            Some(group) => {
                if enabled && !group.enabled {
                    group.next_poll = Instant::now();
                }
                group.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Enabled groups whose next-poll time has arrived, in registration
    /// order.
    pub fn due_groups(&self, now: Instant) -> Vec<DueGroup> {
        self.groups
            .read()
            .iter()
            .filter(|g| g.enabled && g.next_poll <= now)
            .map(|g| DueGroup {
                id: g.id,
                name: g.name.clone(),
                points: g.points.clone(),
            })
            .collect()
    }

    /// Record the outcome of one group read and schedule the next one.
    pub fn mark_polled(&self, id: u32, success: bool, now: Instant) -> bool {
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.id == id) {
            Some(group) => {
                group.last_poll = Some(now);
                group.next_poll = now + group.interval;
                if !success {
                    group.failure_count += 1;
                }
                true
            }
            None => false,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.groups.read().iter().map(|g| g.id).collect()
    }

    /// Shortest configured interval, used to sanity-check the tick rate.
    pub fn min_interval(&self) -> Option<Duration> {
        self.groups.read().iter().map(|g| g.interval).min()
    }

    /// Status introspection for admin/health endpoints.
    pub fn status_json(&self) -> serde_json::Value {
        let groups = self.groups.read();
        let entries: Vec<serde_json::Value> = groups
            .iter()
            .map(|g| {
                serde_json::json!({
                    "id": g.id,
                    "name": g.name,
                    "address": g.address,
                    "interval_ms": g.interval.as_millis() as u64,
                    "enabled": g.enabled,
                    "point_count": g.points.len(),
                    "failure_count": g.failure_count,
                })
            })
            .collect();
        serde_json::json!(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str) -> DataPoint {
        DataPoint {
            id: id.to_string(),
            name: id.to_string(),
            address: "40001".to_string(),
            data_type: Default::default(),
            params: Default::default(),
        }
    }

    fn registers(start: u16, count: u16) -> GroupAddress {
        GroupAddress::Registers {
            register_type: "holding".to_string(),
            start,
            count,
        }
    }

    #[test]
    fn test_new_group_is_due_immediately() {
        let schedule = PollingSchedule::new();
        let id = schedule
            .add_group("g1", registers(0, 2), Duration::from_secs(1), vec![point("p1")])
            .unwrap();

        let due = schedule.due_groups(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].points.len(), 1);
    }

    #[test]
    fn test_point_belongs_to_one_group() {
        let schedule = PollingSchedule::new();
        schedule
            .add_group("g1", registers(0, 2), Duration::from_secs(1), vec![point("p1")])
            .unwrap();
        let err = schedule
            .add_group("g2", registers(10, 2), Duration::from_secs(1), vec![point("p1")])
            .unwrap_err();
        assert!(matches!(err, ColSrvError::ValidationError(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let schedule = PollingSchedule::new();
        assert!(schedule
            .add_group("g1", GroupAddress::PerPoint, Duration::ZERO, vec![point("p1")])
            .is_err());
    }

    #[test]
    fn test_mark_polled_reschedules() {
        let schedule = PollingSchedule::new();
        let id = schedule
            .add_group("g1", registers(0, 2), Duration::from_millis(50), vec![point("p1")])
            .unwrap();

        let now = Instant::now();
        assert!(schedule.mark_polled(id, true, now));
        assert!(schedule.due_groups(now).is_empty());
        assert_eq!(schedule.due_groups(now + Duration::from_millis(60)).len(), 1);
    }

    #[test]
    fn test_failure_increments_but_never_disables() {
        let schedule = PollingSchedule::new();
        let id = schedule
            .add_group("g1", registers(0, 2), Duration::from_millis(10), vec![point("p1")])
            .unwrap();

        let now = Instant::now();
        schedule.mark_polled(id, false, now);
        schedule.mark_polled(id, false, now);
        let status = schedule.status_json();
        assert_eq!(status[0]["failure_count"], 2);
        assert_eq!(status[0]["enabled"], true);
        assert_eq!(schedule.due_groups(now + Duration::from_millis(20)).len(), 1);
    }

    #[test]
    fn test_disable_removes_from_due_set() {
        let schedule = PollingSchedule::new();
        let id = schedule
            .add_group("g1", registers(0, 2), Duration::from_millis(10), vec![point("p1")])
            .unwrap();

        assert!(schedule.set_group_enabled(id, false));
        assert!(schedule.due_groups(Instant::now()).is_empty());
        assert_eq!(schedule.group_count(), 1);

        assert!(schedule.set_group_enabled(id, true));
        assert_eq!(schedule.due_groups(Instant::now()).len(), 1);
    }

    #[test]
    fn test_due_groups_registration_order() {
        let schedule = PollingSchedule::new();
        let a = schedule
            .add_group("a", registers(0, 2), Duration::from_secs(1), vec![point("p1")])
            .unwrap();
        let b = schedule
            .add_group("b", registers(10, 2), Duration::from_secs(1), vec![point("p2")])
            .unwrap();

        let due = schedule.due_groups(Instant::now());
        assert_eq!(due.iter().map(|g| g.id).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_remove_group_frees_points() {
        let schedule = PollingSchedule::new();
        let id = schedule
            .add_group("g1", registers(0, 2), Duration::from_secs(1), vec![point("p1")])
            .unwrap();
        assert!(schedule.remove_group(id));
        assert!(!schedule.remove_group(id));
        // The point can join a new group now
        assert!(schedule
            .add_group("g2", registers(0, 2), Duration::from_secs(1), vec![point("p1")])
            .is_ok());
    }
}
