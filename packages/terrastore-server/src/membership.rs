//! `GroupMembership` (§9): abstracts the injected distributed-object runtime
//! the source leaned on for intra-cluster join/leave into a small
//! collaborator interface. Any gossip or cluster-membership library can
//! satisfy this; [`StaticGroupMembership`] is an in-process stand-in for
//! tests and the [`crate::coordinator::Coordinator`] examples.

use std::sync::{Arc, Mutex};

use terrastore_core::MemberAddress;

type Callback = Box<dyn Fn(MemberAddress) + Send + Sync>;

/// Intra-cluster membership events the [`crate::coordinator::Coordinator`]
/// reacts to (§4.10). `current_members` is a point-in-time snapshot;
/// `on_join`/`on_leave` register callbacks invoked as events occur.
pub trait GroupMembership: Send + Sync + 'static {
    fn current_members(&self) -> Vec<MemberAddress>;
    fn on_join(&self, callback: Callback);
    fn on_leave(&self, callback: Callback);
}

/// An in-process [`GroupMembership`] driven by explicit `join`/`leave`
/// calls, standing in for a gossip/cluster-membership library.
#[derive(Default)]
pub struct StaticGroupMembership {
    members: Mutex<Vec<MemberAddress>>,
    join_callbacks: Mutex<Vec<Callback>>,
    leave_callbacks: Mutex<Vec<Callback>>,
}

impl StaticGroupMembership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `member` and fires every registered join callback.
    pub fn join(&self, member: MemberAddress) {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).push(member.clone());
        for callback in self.join_callbacks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            callback(member.clone());
        }
    }

    /// Removes `member` (by name) and fires every registered leave callback.
    pub fn leave(&self, name: &str) {
        let removed = {
            let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
            let idx = members.iter().position(|m| m.name == name);
            idx.map(|i| members.remove(i))
        };
        let Some(member) = removed else { return };
        for callback in self.leave_callbacks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            callback(member.clone());
        }
    }
}

impl GroupMembership for StaticGroupMembership {
    fn current_members(&self) -> Vec<MemberAddress> {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn on_join(&self, callback: Callback) {
        self.join_callbacks.lock().unwrap_or_else(|e| e.into_inner()).push(callback);
    }

    fn on_leave(&self, callback: Callback) {
        self.leave_callbacks.lock().unwrap_or_else(|e| e.into_inner()).push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(name: &str) -> MemberAddress {
        MemberAddress { name: name.into(), host: "127.0.0.1".into(), port: 9000 }
    }

    #[test]
    fn join_appends_and_fires_callback() {
        let membership = StaticGroupMembership::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        membership.on_join(Box::new(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));

        membership.join(addr("n1"));
        assert_eq!(membership.current_members().len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn leave_removes_and_fires_callback() {
        let membership = StaticGroupMembership::new();
        membership.join(addr("n1"));
        membership.join(addr("n2"));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        membership.on_leave(Box::new(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));

        membership.leave("n1");
        let remaining = membership.current_members();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "n2");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn leave_unknown_member_is_a_no_op() {
        let membership = StaticGroupMembership::new();
        membership.join(addr("n1"));
        membership.leave("not-present");
        assert_eq!(membership.current_members().len(), 1);
    }
}
