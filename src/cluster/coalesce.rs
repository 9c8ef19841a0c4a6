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

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::{sync::mpsc, time};

use super::{
    event::{Event, MemberEventKind, UserEvent},
    member::Member,
};

const COALESCED_CHANNEL_BUFFER: usize = 64;

/// Wraps a raw event subscription in a coalescer: consecutive member
/// transitions for the same node and coalescable user events with the
/// same name collapse to the latest within `coalesce_period`; the
/// pending set flushes after `quiescent_period` of silence or when a
/// non-coalescable event arrives.
pub fn coalesced_events(
    mut rx: mpsc::Receiver<Event>,
    coalesce_period: Duration,
    quiescent_period: Duration,
) -> mpsc::Receiver<Event> {
    let (tx, out_rx) = mpsc::channel(COALESCED_CHANNEL_BUFFER);

    tokio::spawn(async move {
        let mut pending = Pending::default();
        loop {
            let deadline = pending.flush_deadline(coalesce_period, quiescent_period);
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(Event::Member(kind, members)) => {
                            for member in members {
                                pending.push_member(kind, member);
                            }
                        }
                        Some(Event::User(event)) if event.coalesce => {
                            pending.push_user(event);
                        }
                        Some(event) => {
                            // Not coalescable: release everything queued
                            // before it to preserve ordering.
                            for event in pending.flush() {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            for event in pending.flush() {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            return;
                        }
                    }
                }
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    for event in pending.flush() {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    out_rx
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[derive(Default)]
struct Pending {
    members: HashMap<String, (MemberEventKind, Member)>,
    users: HashMap<String, UserEvent>,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Pending {
    fn push_member(&mut self, kind: MemberEventKind, member: Member) {
        self.touch();
        self.members.insert(member.name.clone(), (kind, member));
    }

    fn push_user(&mut self, event: UserEvent) {
        self.touch();
        match self.users.get_mut(&event.name) {
            Some(existing) if existing.ltime >= event.ltime => (),
            Some(existing) => *existing = event,
            None => {
                self.users.insert(event.name.clone(), event);
            }
        }
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.users.is_empty()
    }

    /// The pending set flushes at the earlier of "coalesce period since
    /// the first event" and "quiescent period since the last".
    fn flush_deadline(
        &self,
        coalesce_period: Duration,
        quiescent_period: Duration,
    ) -> Option<Instant> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => {
                Some((first + coalesce_period).min(last + quiescent_period))
            }
            _ => None,
        }
    }

    fn flush(&mut self) -> Vec<Event> {
        if self.is_empty() {
            self.first = None;
            self.last = None;
            return Vec::new();
        }

        // Group surviving member transitions by kind.
        let mut by_kind: HashMap<MemberEventKind, Vec<Member>> = HashMap::new();
        for (_, (kind, member)) in std::mem::take(&mut self.members) {
            by_kind.entry(kind).or_default().push(member);
        }
        let mut events = by_kind
            .into_iter()
            .map(|(kind, mut members)| {
                members.sort_by(|a, b| a.name.cmp(&b.name));
                Event::Member(kind, members)
            })
            .collect::<Vec<_>>();

        let mut users = std::mem::take(&mut self.users)
            .into_values()
            .collect::<Vec<_>>();
        users.sort_by_key(|event| event.ltime);
        events.extend(users.into_iter().map(Event::User));

        self.first = None;
        self.last = None;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, payload: &[u8], ltime: u64) -> Event {
        Event::User(UserEvent {
            ltime,
            name: name.to_string(),
            payload: payload.to_vec(),
            coalesce: true,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_user_events_collapse_to_the_latest() {
        let (tx, rx) = mpsc::channel(16);
        let mut out = coalesced_events(rx, Duration::from_secs(3), Duration::from_secs(2));

        tx.send(user("deploy", b"v1", 1)).await.unwrap();
        tx.send(user("deploy", b"v2", 2)).await.unwrap();
        tx.send(user("deploy", b"v3", 3)).await.unwrap();

        let event = out.recv().await.unwrap();
        match event {
            Event::User(event) => {
                assert_eq!(event.payload, b"v3");
                assert_eq!(event.ltime, 3);
            }
            other => panic!("expected a user event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ltime_never_replaces_a_newer_payload() {
        let (tx, rx) = mpsc::channel(16);
        let mut out = coalesced_events(rx, Duration::from_secs(3), Duration::from_secs(2));

        tx.send(user("deploy", b"v2", 5)).await.unwrap();
        tx.send(user("deploy", b"v1", 4)).await.unwrap();

        match out.recv().await.unwrap() {
            Event::User(event) => assert_eq!(event.payload, b"v2"),
            other => panic!("expected a user event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_coalescable_events_flush_and_pass_through() {
        let (tx, rx) = mpsc::channel(16);
        let mut out = coalesced_events(rx, Duration::from_secs(3), Duration::from_secs(2));

        tx.send(user("deploy", b"v1", 1)).await.unwrap();
        let direct = Event::User(UserEvent {
            ltime: 2,
            name: "restart".to_string(),
            payload: Vec::new(),
            coalesce: false,
        });
        tx.send(direct).await.unwrap();

        // The pending coalesced event is released first.
        match out.recv().await.unwrap() {
            Event::User(event) => assert_eq!(event.name, "deploy"),
            other => panic!("unexpected {:?}", other),
        }
        match out.recv().await.unwrap() {
            Event::User(event) => assert_eq!(event.name, "restart"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
