// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

use crate::models::value::ParameterValue;

/// The attribute kinds a data-model node may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Object,
    Writable,
    Value,
    Notification,
    AccessList,
}

bitflags::bitflags! {
    /// Bit set of [`AttributeKind`]s, used where a request wants several
    /// kinds refreshed at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttributeMask: u8 {
        const OBJECT = 1;
        const WRITABLE = 1 << 1;
        const VALUE = 1 << 2;
        const NOTIFICATION = 1 << 3;
        const ACCESS_LIST = 1 << 4;
    }
}

/// Per-node attribute store: one optional `(timestamp, payload)` slot per
/// kind. The timestamp records when the device last confirmed the payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<(i64, bool)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<(i64, bool)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<(i64, ParameterValue)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<(i64, u8)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<(i64, Vec<String>)>,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        self.object.is_none()
            && self.writable.is_none()
            && self.value.is_none()
            && self.notification.is_none()
            && self.access_list.is_none()
    }

    /// True when the node is known to be an interior (object) node.
    pub fn is_object(&self) -> Option<bool> {
        self.object.map(|(_, o)| o)
    }

    pub fn is_writable(&self) -> Option<bool> {
        self.writable.map(|(_, w)| w)
    }

    /// Merges `newer` into `self`, each attribute independently, keeping
    /// whichever side carries the higher timestamp. Returns the kinds whose
    /// payload actually changed.
    pub fn merge(&mut self, newer: &Attributes) -> Vec<AttributeKind> {
        let mut changed = Vec::new();

        fn pick<T: PartialEq + Clone>(
            cur: &mut Option<(i64, T)>,
            new: &Option<(i64, T)>,
        ) -> bool {
            match (cur.as_ref(), new) {
                (_, None) => false,
                (None, Some(n)) => {
                    *cur = Some(n.clone());
                    true
                },
                (Some((ct, cv)), Some((nt, nv))) => {
                    if nt >= ct {
                        let replaced = cv != nv;
                        *cur = Some((*nt, nv.clone()));
                        replaced
                    } else {
                        false
                    }
                },
            }
        }

        if pick(&mut self.object, &newer.object) {
            changed.push(AttributeKind::Object);
        }
        if pick(&mut self.writable, &newer.writable) {
            changed.push(AttributeKind::Writable);
        }
        if pick(&mut self.value, &newer.value) {
            changed.push(AttributeKind::Value);
        }
        if pick(&mut self.notification, &newer.notification) {
            changed.push(AttributeKind::Notification);
        }
        if pick(&mut self.access_list, &newer.access_list) {
            changed.push(AttributeKind::AccessList);
        }
        changed
    }

    /// Drops attributes whose timestamp is strictly below the corresponding
    /// entry in `stale`. Returns true when anything was removed.
    pub fn prune_older_than(&mut self, stale: &AttributeTimestamps) -> bool {
        let mut removed = false;

        fn drop_if<T>(slot: &mut Option<(i64, T)>, limit: Option<i64>) -> bool {
            if let (Some((ts, _)), Some(lim)) = (slot.as_ref(), limit)
                && *ts < lim
            {
                *slot = None;
                return true;
            }
            false
        }

        removed |= drop_if(&mut self.object, stale.object);
        removed |= drop_if(&mut self.writable, stale.writable);
        removed |= drop_if(&mut self.value, stale.value);
        removed |= drop_if(&mut self.notification, stale.notification);
        removed |= drop_if(&mut self.access_list, stale.access_list);
        removed
    }
}

/// Per-kind freshness demands of a declaration (`attrGet`): the attribute
/// must have been confirmed no earlier than the given timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeTimestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<i64>,
}

impl AttributeTimestamps {
    /// The kinds this demand set covers.
    pub fn mask(&self) -> AttributeMask {
        let mut mask = AttributeMask::empty();
        if self.object.is_some() {
            mask |= AttributeMask::OBJECT;
        }
        if self.writable.is_some() {
            mask |= AttributeMask::WRITABLE;
        }
        if self.value.is_some() {
            mask |= AttributeMask::VALUE;
        }
        if self.notification.is_some() {
            mask |= AttributeMask::NOTIFICATION;
        }
        if self.access_list.is_some() {
            mask |= AttributeMask::ACCESS_LIST;
        }
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.object.is_none()
            && self.writable.is_none()
            && self.value.is_none()
            && self.notification.is_none()
            && self.access_list.is_none()
    }

    /// Max-merges `other` into `self`.
    pub fn merge(&mut self, other: &AttributeTimestamps) {
        fn up(a: &mut Option<i64>, b: Option<i64>) {
            if let Some(t) = b {
                *a = Some(a.map_or(t, |cur| cur.max(t)));
            }
        }
        up(&mut self.object, other.object);
        up(&mut self.writable, other.writable);
        up(&mut self.value, other.value);
        up(&mut self.notification, other.notification);
        up(&mut self.access_list, other.access_list);
    }

    /// Caps every demand at `limit`.
    pub fn cap(&mut self, limit: i64) {
        for slot in [
            &mut self.object,
            &mut self.writable,
            &mut self.value,
            &mut self.notification,
            &mut self.access_list,
        ] {
            if let Some(t) = slot {
                *t = (*t).min(limit);
            }
        }
    }
}

/// Desired attribute payloads of a declaration (`attrSet`). Only the
/// writable attribute kinds can be declared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<crate::models::value::Literal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<Vec<String>>,
}

impl AttributeValues {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.notification.is_none() && self.access_list.is_none()
    }

    /// Overwrites the slots `other` provides.
    pub fn merge(&mut self, other: &AttributeValues) {
        if let Some(v) = &other.value {
            self.value = Some(v.clone());
        }
        if let Some(n) = other.notification {
            self.notification = Some(n);
        }
        if let Some(a) = &other.access_list {
            self.access_list = Some(a.clone());
        }
    }
}

/// Ordered access-list comparison: TR-069 access lists are order-sensitive.
pub fn compare_access_lists(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}
