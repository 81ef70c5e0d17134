//! Condition ledger for status reporting
//!
//! A [`ConditionSet`] holds at most one condition per type. Every reconcile
//! pass starts from a freshly initialised set (all Unknown) and overwrites
//! entries as stages complete. Only the transition timestamps of the
//! previous pass survive, via [`ConditionSet::restore_transition_times`].
//!
//! `Ready` is never marked directly by a stage. It is derived from the other
//! conditions in [`ConditionSet::derive_ready`].

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Condition, ConditionSeverity, ConditionStatus};

/// Overall readiness, derived from every other condition
pub const READY: &str = "Ready";
/// Most recent sibling deployment completed for this node set
pub const DEPLOYMENT_READY: &str = "DeploymentReady";
/// Required inputs (SSH key secret) are present
pub const INPUT_READY: &str = "InputReady";
/// Services validated and inventory generated
pub const SETUP_READY: &str = "SetupReady";
/// IP reservations exist for every node
pub const IP_RESERVATION_READY: &str = "NodeSetIPReservationReady";
/// DNS data published for every node
pub const DNS_DATA_READY: &str = "NodeSetDNSDataReady";
/// ServiceAccount and RoleBinding provisioned
pub const SERVICE_ACCOUNT_READY: &str = "ServiceAccountReady";
/// Bare metal hosts provisioned
pub const BAREMETAL_PROVISION_READY: &str = "NodeSetBaremetalProvisionReady";

/// Reason used when a condition is reset at the start of a pass
pub const INIT_REASON: &str = "Init";
/// Reason for work that has been requested but has not finished
pub const REQUESTED_REASON: &str = "Requested";
/// Reason for a completed stage
pub const READY_REASON: &str = "Ready";
/// Reason for a failed stage
pub const ERROR_REASON: &str = "Error";
/// Reason for a stage nobody asked for yet
pub const NOT_REQUESTED_REASON: &str = "NotRequested";

/// Ordered collection of conditions keyed by type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    /// Build a set with `Ready` first followed by `types`, all Unknown/Init
    pub fn init<'a>(types: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self(vec![unknown(READY)]);
        for type_ in types {
            if set.get(type_).is_none() {
                set.0.push(unknown(type_));
            }
        }
        set
    }

    /// Look up a condition by type
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Iterate conditions in ledger order
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set holds no conditions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the condition exists and is True
    pub fn is_true(&self, type_: &str) -> bool {
        self.status_of(type_) == Some(ConditionStatus::True)
    }

    /// True when the condition exists and is Unknown
    pub fn is_unknown(&self, type_: &str) -> bool {
        self.status_of(type_) == Some(ConditionStatus::Unknown)
    }

    fn status_of(&self, type_: &str) -> Option<ConditionStatus> {
        self.get(type_).map(|c| c.status)
    }

    /// Insert or replace a condition
    ///
    /// The transition time only moves when the status changes; otherwise the
    /// stored timestamp is kept.
    pub fn set(&mut self, mut condition: Condition) {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.0.push(condition),
        }
    }

    /// Mark a condition True
    pub fn mark_true(&mut self, type_: &str, message: impl Into<String>) {
        self.set(Condition::new(
            type_,
            ConditionStatus::True,
            READY_REASON,
            message,
        ));
    }

    /// Mark a condition False with a reason and severity
    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.set(Condition::new(type_, ConditionStatus::False, reason, message).with_severity(severity));
    }

    /// Mark a condition Unknown
    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set(Condition::new(
            type_,
            ConditionStatus::Unknown,
            reason,
            message,
        ));
    }

    /// Copy transition times from `previous` for every type whose status did not change
    pub fn restore_transition_times(&mut self, previous: &ConditionSet) {
        for condition in &mut self.0 {
            if let Some(prev) = previous.get(&condition.type_) {
                if prev.status == condition.status {
                    condition.last_transition_time = prev.last_transition_time;
                }
            }
        }
    }

    /// Copy whole conditions from `previous` for the given types
    ///
    /// Types missing from `previous` are left as they are.
    pub fn carry_forward(&mut self, previous: &ConditionSet, types: &[&str]) {
        for type_ in types {
            if let Some(prev) = previous.get(type_) {
                match self.0.iter_mut().find(|c| c.type_ == *type_) {
                    Some(existing) => *existing = prev.clone(),
                    None => self.0.push(prev.clone()),
                }
            }
        }
    }

    /// True when every condition other than `Ready` is True
    pub fn all_sub_conditions_true(&self) -> bool {
        self.0
            .iter()
            .filter(|c| c.type_ != READY)
            .all(|c| c.status == ConditionStatus::True)
    }

    /// Summarise the most informative non-True sub-condition under `target`
    ///
    /// Priority: False/Error, False/Warning, other False, Unknown. Ties go to
    /// the earliest entry in the ledger. When every sub-condition is True the
    /// result is True.
    pub fn mirror(&self, target: &str) -> Condition {
        let rank = |c: &Condition| match (c.status, c.severity) {
            (ConditionStatus::False, Some(ConditionSeverity::Error)) => 0,
            (ConditionStatus::False, Some(ConditionSeverity::Warning)) => 1,
            (ConditionStatus::False, _) => 2,
            (ConditionStatus::Unknown, _) => 3,
            (ConditionStatus::True, _) => 4,
        };

        let source = self
            .0
            .iter()
            .filter(|c| c.type_ != target && c.type_ != READY)
            .filter(|c| c.status != ConditionStatus::True)
            .min_by_key(|c| rank(c));

        match source {
            Some(c) => Condition {
                type_: target.to_string(),
                status: c.status,
                severity: c.severity,
                reason: c.reason.clone(),
                message: c.message.clone(),
                last_transition_time: Utc::now(),
            },
            None => Condition::new(target, ConditionStatus::True, READY_REASON, "Setup complete"),
        }
    }

    /// Derive `Ready` from the sub-conditions
    ///
    /// Ready becomes True when every sub-condition is True. Otherwise, if
    /// Ready is still Unknown it mirrors the most informative sub-condition;
    /// an explicitly set Ready is left alone.
    pub fn derive_ready(&mut self, ready_message: &str) {
        if self.all_sub_conditions_true() {
            self.mark_true(READY, ready_message);
        } else if self.get(READY).is_none() || self.is_unknown(READY) {
            let mirrored = self.mirror(READY);
            self.set(mirrored);
        }
    }

    /// Restore timestamps, derive `Ready`, then stabilise Ready's own timestamp
    pub fn finalize(&mut self, previous: &ConditionSet, ready_message: &str) {
        self.restore_transition_times(previous);
        self.derive_ready(ready_message);
        self.restore_transition_times(previous);
    }
}

impl FromIterator<Condition> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        let mut set = Self::default();
        for condition in iter {
            set.set(condition);
        }
        set
    }
}

fn unknown(type_: &str) -> Condition {
    Condition::new(type_, ConditionStatus::Unknown, INIT_REASON, INIT_REASON)
}
