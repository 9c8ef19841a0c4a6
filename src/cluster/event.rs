/*
 * Copyright (c) 2020-2022, Stalwart Labs Ltd.
 *
 * This file is part of the Stalwart Mesh Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::sync::Arc;

use crate::lamport::LamportTime;

use super::{member::Member, query::QueryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

impl MemberEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberEventKind::Join => "member-join",
            MemberEventKind::Leave => "member-leave",
            MemberEventKind::Failed => "member-failed",
            MemberEventKind::Update => "member-update",
            MemberEventKind::Reap => "member-reap",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserEvent {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

/// Everything subscribers can observe, as a tagged union.
#[derive(Debug, Clone)]
pub enum Event {
    Member(MemberEventKind, Vec<Member>),
    User(UserEvent),
    Query(Arc<QueryEvent>),
}

impl Event {
    pub fn name(&self) -> String {
        match self {
            Event::Member(kind, _) => kind.as_str().to_string(),
            Event::User(event) => format!("user:{}", event.name),
            Event::Query(query) => format!("query:{}", query.name),
        }
    }
}

/// Subscription filters accepted by the RPC `stream` command: `*`,
/// `member-join`, `user`, `user:deploy`, `query`, `query:load`, or a
/// comma-separated set of those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Member(MemberEventKind),
    User(Option<String>),
    Query(Option<String>),
}

impl EventFilter {
    pub fn parse(spec: &str) -> Option<Vec<EventFilter>> {
        let mut filters = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let filter = match part {
                "*" | "" => EventFilter::All,
                "member-join" => EventFilter::Member(MemberEventKind::Join),
                "member-leave" => EventFilter::Member(MemberEventKind::Leave),
                "member-failed" => EventFilter::Member(MemberEventKind::Failed),
                "member-update" => EventFilter::Member(MemberEventKind::Update),
                "member-reap" => EventFilter::Member(MemberEventKind::Reap),
                "user" => EventFilter::User(None),
                "query" => EventFilter::Query(None),
                other => {
                    if let Some(name) = other.strip_prefix("user:") {
                        EventFilter::User(Some(name.to_string()))
                    } else if let Some(name) = other.strip_prefix("query:") {
                        EventFilter::Query(Some(name.to_string()))
                    } else {
                        return None;
                    }
                }
            };
            filters.push(filter);
        }
        if filters.is_empty() {
            filters.push(EventFilter::All);
        }
        Some(filters)
    }

    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::Member(kind), Event::Member(event_kind, _)) => kind == event_kind,
            (EventFilter::User(None), Event::User(_)) => true,
            (EventFilter::User(Some(name)), Event::User(event)) => &event.name == name,
            (EventFilter::Query(None), Event::Query(_)) => true,
            (EventFilter::Query(Some(name)), Event::Query(query)) => &query.name == name,
            _ => false,
        }
    }
}

struct EventSlot {
    ltime: LamportTime,
    events: Vec<(String, Vec<u8>, bool)>,
}

/// Fixed-capacity ring of recently seen user events, indexed by
/// `ltime % capacity`. Consulted to drop duplicates and replays, and
/// exchanged during push/pull so restarting nodes catch up.
pub struct RecentEvents {
    slots: Vec<Option<EventSlot>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        RecentEvents { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records an event; returns false when the identical event was
    /// already seen at this Lamport time.
    pub fn witness(&mut self, ltime: LamportTime, name: &str, payload: &[u8], cc: bool) -> bool {
        let idx = (ltime as usize) % self.slots.len();
        match &mut self.slots[idx] {
            Some(slot) if slot.ltime == ltime => {
                if slot
                    .events
                    .iter()
                    .any(|(n, p, _)| n == name && p.as_slice() == payload)
                {
                    return false;
                }
                slot.events.push((name.to_string(), payload.to_vec(), cc));
                true
            }
            slot => {
                *slot = Some(EventSlot {
                    ltime,
                    events: vec![(name.to_string(), payload.to_vec(), cc)],
                });
                true
            }
        }
    }

    /// Everything currently buffered, oldest first; the push/pull user
    /// state ships this to peers for replay.
    pub fn snapshot(&self) -> Vec<(LamportTime, String, Vec<u8>, bool)> {
        let mut events = self
            .slots
            .iter()
            .flatten()
            .flat_map(|slot| {
                slot.events
                    .iter()
                    .map(|(name, payload, cc)| (slot.ltime, name.clone(), payload.clone(), *cc))
            })
            .collect::<Vec<_>>();
        events.sort_by_key(|(ltime, _, _, _)| *ltime);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parsing() {
        assert_eq!(EventFilter::parse("*"), Some(vec![EventFilter::All]));
        assert_eq!(
            EventFilter::parse("member-join,user:deploy"),
            Some(vec![
                EventFilter::Member(MemberEventKind::Join),
                EventFilter::User(Some("deploy".to_string())),
            ])
        );
        assert_eq!(
            EventFilter::parse("query"),
            Some(vec![EventFilter::Query(None)])
        );
        assert!(EventFilter::parse("member-explode").is_none());
        assert_eq!(EventFilter::parse(""), Some(vec![EventFilter::All]));
    }

    #[test]
    fn filter_matching() {
        let event = Event::User(UserEvent {
            ltime: 1,
            name: "deploy".to_string(),
            payload: Vec::new(),
            coalesce: true,
        });
        assert!(EventFilter::All.matches(&event));
        assert!(EventFilter::User(None).matches(&event));
        assert!(EventFilter::User(Some("deploy".to_string())).matches(&event));
        assert!(!EventFilter::User(Some("other".to_string())).matches(&event));
        assert!(!EventFilter::Member(MemberEventKind::Join).matches(&event));
    }

    #[test]
    fn recent_events_deduplicate() {
        let mut recent = RecentEvents::new(8);
        assert!(recent.witness(1, "deploy", b"v1", true));
        assert!(!recent.witness(1, "deploy", b"v1", true));
        // Same time, different payload is a distinct event.
        assert!(recent.witness(1, "deploy", b"v2", true));
        // Same name at a later time is a distinct event.
        assert!(recent.witness(2, "deploy", b"v1", true));
    }

    #[test]
    fn ring_slots_are_recycled() {
        let mut recent = RecentEvents::new(4);
        assert!(recent.witness(1, "a", b"", false));
        // ltime 5 maps to the same slot and evicts it.
        assert!(recent.witness(5, "b", b"", false));
        // The evicted entry is forgotten, so it reads as new again.
        assert!(recent.witness(1, "a", b"", false));
    }

    #[test]
    fn snapshot_is_ltime_ordered() {
        let mut recent = RecentEvents::new(8);
        recent.witness(3, "b", b"2", false);
        recent.witness(1, "a", b"1", true);
        let snapshot = recent.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, 1);
        assert_eq!(snapshot[1].0, 3);
    }
}
