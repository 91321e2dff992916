//! Address allocation state machine
//!
//! Each address moves through
//! `Free -> Requesting -> ActiveExclusive | ActiveShared(n) -> Releasing -> Free`.
//! [`AddressTable`] tracks holders and FIFO waiters for every address of one
//! connection and answers each transition with the [`Action`]s the
//! connection task must carry out (hardware round-trips, grants,
//! dispossessions). It is synchronous and owns no I/O, which keeps the
//! sharing and contention rules testable in isolation.
//!
//! Waiters are opaque values `W`; the connection task stores the reply
//! channel of the caller in them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use loco_protocol::{Address, Binding};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ContentionPolicy;

/// Identifies one granted throttle on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThrottleId(pub u64);

impl fmt::Display for ThrottleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Requested form of control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShareMode {
    /// Sole control of the address
    #[default]
    Exclusive,
    /// Control alongside other shared holders
    Shared,
}

/// Allocation state of one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Free,
    Requesting,
    ActiveExclusive,
    ActiveShared(usize),
    Releasing,
}

/// Snapshot of one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStatus {
    pub state: AllocationState,
    /// Holders in admission order; the first one is the primary holder
    pub holders: Vec<ThrottleId>,
    /// Requests queued behind the current state
    pub waiting: usize,
    /// Vendor binding while the address is active or releasing
    pub binding: Option<Binding>,
}

impl AddressStatus {
    /// First-admitted holder
    pub fn primary(&self) -> Option<ThrottleId> {
        self.holders.first().copied()
    }
}

/// Control handed to a waiter
#[derive(Debug, PartialEq)]
pub struct Grant<W> {
    pub address: Address,
    pub throttle: ThrottleId,
    pub mode: ShareMode,
    pub binding: Binding,
    pub waiter: W,
}

/// Work the connection task performs on behalf of the table
#[derive(Debug, PartialEq)]
pub enum Action<W> {
    /// Ask the command station for the address
    SendAcquire { address: Address },
    /// Hand the address back to the command station
    SendRelease { address: Address, binding: Binding },
    /// Deliver a throttle
    Grant(Grant<W>),
    /// Tell a waiter its request failed
    Refuse {
        address: Address,
        waiter: W,
        reason: String,
    },
    /// A holder lost control to a steal
    Dispossess {
        address: Address,
        throttle: ThrottleId,
    },
}

/// Error for operations on a throttle the table does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotHeld(pub ThrottleId);

struct Waiting<W> {
    mode: ShareMode,
    waiter: W,
}

enum Phase<W> {
    Free,
    Requesting {
        requester: Waiting<W>,
    },
    Active {
        mode: ShareMode,
        binding: Binding,
        holders: Vec<ThrottleId>,
    },
    Releasing {
        binding: Binding,
        grace_deadline: Option<Instant>,
    },
}

struct AddressRecord<W> {
    phase: Phase<W>,
    waiters: VecDeque<Waiting<W>>,
}

impl<W> AddressRecord<W> {
    fn new() -> Self {
        Self {
            phase: Phase::Free,
            waiters: VecDeque::new(),
        }
    }

    fn state(&self) -> AllocationState {
        match &self.phase {
            Phase::Free => AllocationState::Free,
            Phase::Requesting { .. } => AllocationState::Requesting,
            Phase::Active {
                mode: ShareMode::Exclusive,
                ..
            } => AllocationState::ActiveExclusive,
            Phase::Active { holders, .. } => AllocationState::ActiveShared(holders.len()),
            Phase::Releasing { .. } => AllocationState::Releasing,
        }
    }
}

/// Allocation records for every address of one connection
pub struct AddressTable<W> {
    policy: ContentionPolicy,
    round_trip: bool,
    alive: fn(&W) -> bool,
    records: BTreeMap<Address, AddressRecord<W>>,
    holders: HashMap<ThrottleId, (Address, ShareMode)>,
    next_throttle: u64,
}

impl<W> AddressTable<W> {
    /// Create a table
    ///
    /// `round_trip` says whether the command station must be asked before an
    /// address becomes active. `alive` reports whether a queued waiter still
    /// wants its answer; dead waiters are skipped when the address frees up.
    pub fn new(policy: ContentionPolicy, round_trip: bool, alive: fn(&W) -> bool) -> Self {
        Self {
            policy,
            round_trip,
            alive,
            records: BTreeMap::new(),
            holders: HashMap::new(),
            next_throttle: 0,
        }
    }

    /// Snapshot of one address
    pub fn status(&self, address: Address) -> AddressStatus {
        match self.records.get(&address) {
            None => AddressStatus {
                state: AllocationState::Free,
                holders: Vec::new(),
                waiting: 0,
                binding: None,
            },
            Some(record) => {
                let (holders, binding) = match &record.phase {
                    Phase::Active {
                        holders, binding, ..
                    } => (holders.clone(), Some(*binding)),
                    Phase::Releasing { binding, .. } => (Vec::new(), Some(*binding)),
                    _ => (Vec::new(), None),
                };
                let requesting = usize::from(matches!(record.phase, Phase::Requesting { .. }));
                AddressStatus {
                    state: record.state(),
                    holders,
                    waiting: record.waiters.len() + requesting,
                    binding,
                }
            }
        }
    }

    /// Binding of an active address
    pub fn binding(&self, address: Address) -> Option<Binding> {
        match self.records.get(&address)?.phase {
            Phase::Active { binding, .. } => Some(binding),
            _ => None,
        }
    }

    /// Holders of an active address, in admission order
    pub fn holders_of(&self, address: Address) -> &[ThrottleId] {
        match self.records.get(&address).map(|r| &r.phase) {
            Some(Phase::Active { holders, .. }) => holders.as_slice(),
            _ => &[],
        }
    }

    /// Address and mode a throttle holds
    pub fn lookup(&self, throttle: ThrottleId) -> Option<(Address, ShareMode)> {
        self.holders.get(&throttle).copied()
    }

    /// Active address bound to a command-station slot
    pub fn address_for_slot(&self, slot: u8) -> Option<Address> {
        self.records
            .iter()
            .find_map(|(address, record)| match &record.phase {
                Phase::Active { binding, .. } if binding.slot == Some(slot) => Some(*address),
                _ => None,
            })
    }

    /// Addresses that currently have holders
    pub fn active_addresses(&self) -> Vec<Address> {
        self.records
            .iter()
            .filter(|(_, r)| matches!(r.phase, Phase::Active { .. }))
            .map(|(a, _)| *a)
            .collect()
    }

    /// Admit a request
    pub fn request(&mut self, address: Address, mode: ShareMode, waiter: W) -> Vec<Action<W>> {
        let policy = self.policy;
        let record = self
            .records
            .entry(address)
            .or_insert_with(AddressRecord::new);
        let request = Waiting { mode, waiter };

        match &record.phase {
            Phase::Free => self.admit(address, request),
            Phase::Requesting { .. } | Phase::Releasing { .. } => {
                debug!("{} busy, queueing {:?} request", address, mode);
                record.waiters.push_back(request);
                Vec::new()
            }
            Phase::Active { mode: held, .. } => {
                let compatible = *held == ShareMode::Shared && mode == ShareMode::Shared;
                if compatible && record.waiters.is_empty() {
                    self.join(address, request)
                } else if !compatible && policy == ContentionPolicy::Steal {
                    self.steal(address, request)
                } else {
                    debug!("{} held, queueing {:?} request", address, mode);
                    record.waiters.push_back(request);
                    Vec::new()
                }
            }
        }
    }

    /// The acquisition round-trip succeeded
    pub fn acquired(&mut self, address: Address, binding: Binding) -> Vec<Action<W>> {
        let Some(record) = self.records.get_mut(&address) else {
            return Vec::new();
        };
        match std::mem::replace(&mut record.phase, Phase::Free) {
            Phase::Requesting { requester } => self.activate(address, binding, requester),
            other => {
                record.phase = other;
                Vec::new()
            }
        }
    }

    /// The acquisition round-trip was refused or timed out
    pub fn acquire_failed(&mut self, address: Address, reason: &str) -> Vec<Action<W>> {
        let Some(record) = self.records.get_mut(&address) else {
            return Vec::new();
        };
        let requester = match std::mem::replace(&mut record.phase, Phase::Free) {
            Phase::Requesting { requester } => requester,
            other => {
                record.phase = other;
                return Vec::new();
            }
        };
        debug!("{} acquisition failed: {}", address, reason);
        let mut actions = vec![Action::Refuse {
            address,
            waiter: requester.waiter,
            reason: reason.to_string(),
        }];
        actions.extend(self.settle(address));
        actions
    }

    /// Give up a throttle
    ///
    /// The last holder moves the address to `Releasing` and asks for the
    /// vendor release frame.
    pub fn release(&mut self, throttle: ThrottleId) -> Result<Vec<Action<W>>, NotHeld> {
        let (address, _) = self.holders.remove(&throttle).ok_or(NotHeld(throttle))?;
        let Some(record) = self.records.get_mut(&address) else {
            return Ok(Vec::new());
        };
        let Phase::Active {
            holders, binding, ..
        } = &mut record.phase
        else {
            return Ok(Vec::new());
        };
        holders.retain(|h| *h != throttle);
        if !holders.is_empty() {
            debug!("{} released by {}, {} holder(s) left", address, throttle, holders.len());
            return Ok(Vec::new());
        }
        let binding = *binding;
        debug!("{} released by last holder {}", address, throttle);
        record.phase = Phase::Releasing {
            binding,
            grace_deadline: None,
        };
        Ok(vec![Action::SendRelease { address, binding }])
    }

    /// The vendor release completed
    pub fn released(&mut self, address: Address) -> Vec<Action<W>> {
        match self.records.get_mut(&address) {
            Some(record) if matches!(record.phase, Phase::Releasing { .. }) => {
                record.phase = Phase::Free;
                self.settle(address)
            }
            _ => Vec::new(),
        }
    }

    /// The vendor release went unanswered; free the address after `grace`
    pub fn release_unconfirmed(&mut self, address: Address, now: Instant, grace: Duration) {
        if let Some(AddressRecord {
            phase: Phase::Releasing { grace_deadline, .. },
            ..
        }) = self.records.get_mut(&address)
        {
            *grace_deadline = Some(now + grace);
        }
    }

    /// Earliest pending release grace deadline
    pub fn next_grace_deadline(&self) -> Option<Instant> {
        self.records
            .values()
            .filter_map(|r| match r.phase {
                Phase::Releasing { grace_deadline, .. } => grace_deadline,
                _ => None,
            })
            .min()
    }

    /// Free every address whose release grace has run out
    pub fn expire_grace(&mut self, now: Instant) -> Vec<Action<W>> {
        let due: Vec<Address> = self
            .records
            .iter()
            .filter(|(_, r)| {
                matches!(r.phase, Phase::Releasing { grace_deadline: Some(d), .. } if d <= now)
            })
            .map(|(a, _)| *a)
            .collect();
        let mut actions = Vec::new();
        for address in due {
            debug!("{} release grace expired", address);
            actions.extend(self.released(address));
        }
        actions
    }

    /// Drop every record, returning holders and waiters that must be told
    pub fn drain(&mut self) -> (Vec<(ThrottleId, Address)>, Vec<(Address, W)>) {
        let mut holders: Vec<(ThrottleId, Address)> = self
            .holders
            .drain()
            .map(|(id, (address, _))| (id, address))
            .collect();
        holders.sort();

        let mut waiters = Vec::new();
        for (address, record) in std::mem::take(&mut self.records) {
            if let Phase::Requesting { requester } = record.phase {
                waiters.push((address, requester.waiter));
            }
            waiters.extend(record.waiters.into_iter().map(|w| (address, w.waiter)));
        }
        (holders, waiters)
    }

    fn next_id(&mut self) -> ThrottleId {
        let id = ThrottleId(self.next_throttle);
        self.next_throttle += 1;
        id
    }

    /// Start control of a free address
    fn admit(&mut self, address: Address, request: Waiting<W>) -> Vec<Action<W>> {
        if self.round_trip {
            if let Some(record) = self.records.get_mut(&address) {
                debug!("{} requesting from command station", address);
                record.phase = Phase::Requesting { requester: request };
            }
            return vec![Action::SendAcquire { address }];
        }
        self.activate(address, Binding::unslotted(address), request)
    }

    /// Make an address active for its first holder, then admit compatible
    /// waiters
    fn activate(&mut self, address: Address, binding: Binding, first: Waiting<W>) -> Vec<Action<W>> {
        let throttle = self.next_id();
        self.holders.insert(throttle, (address, first.mode));
        if let Some(record) = self.records.get_mut(&address) {
            record.phase = Phase::Active {
                mode: first.mode,
                binding,
                holders: vec![throttle],
            };
        }
        debug!("{} granted to {} ({:?})", address, throttle, first.mode);
        let mut actions = vec![Action::Grant(Grant {
            address,
            throttle,
            mode: first.mode,
            binding,
            waiter: first.waiter,
        })];
        if first.mode == ShareMode::Shared {
            actions.extend(self.admit_shared_waiters(address));
        }
        actions
    }

    /// Add a shared holder to an active shared address
    fn join(&mut self, address: Address, request: Waiting<W>) -> Vec<Action<W>> {
        let throttle = self.next_id();
        let Some(Phase::Active {
            holders, binding, ..
        }) = self.records.get_mut(&address).map(|r| &mut r.phase)
        else {
            return Vec::new();
        };
        holders.push(throttle);
        let binding = *binding;
        self.holders.insert(throttle, (address, ShareMode::Shared));
        debug!("{} shared with {}", address, throttle);
        vec![Action::Grant(Grant {
            address,
            throttle,
            mode: ShareMode::Shared,
            binding,
            waiter: request.waiter,
        })]
    }

    /// Dispossess every holder and grant `request` with the same binding
    fn steal(&mut self, address: Address, request: Waiting<W>) -> Vec<Action<W>> {
        let Some(record) = self.records.get_mut(&address) else {
            return Vec::new();
        };
        let (holders, binding) = match std::mem::replace(&mut record.phase, Phase::Free) {
            Phase::Active {
                holders, binding, ..
            } => (holders, binding),
            other => {
                record.phase = other;
                return Vec::new();
            }
        };
        let mut actions: Vec<Action<W>> = holders
            .into_iter()
            .map(|throttle| {
                self.holders.remove(&throttle);
                debug!("{} stolen from {}", address, throttle);
                Action::Dispossess { address, throttle }
            })
            .collect();
        actions.extend(self.activate(address, binding, request));
        actions
    }

    /// Grant shared waiters at the head of the queue
    fn admit_shared_waiters(&mut self, address: Address) -> Vec<Action<W>> {
        let mut actions = Vec::new();
        loop {
            let alive = self.alive;
            let Some(record) = self.records.get_mut(&address) else {
                break;
            };
            while record.waiters.front().is_some_and(|w| !alive(&w.waiter)) {
                record.waiters.pop_front();
            }
            if !record
                .waiters
                .front()
                .is_some_and(|w| w.mode == ShareMode::Shared)
            {
                break;
            }
            let Some(next) = record.waiters.pop_front() else {
                break;
            };
            actions.extend(self.join(address, next));
        }
        actions
    }

    /// Hand a free address to the next live waiter, or forget it
    fn settle(&mut self, address: Address) -> Vec<Action<W>> {
        let alive = self.alive;
        let Some(record) = self.records.get_mut(&address) else {
            return Vec::new();
        };
        let next = loop {
            match record.waiters.pop_front() {
                Some(w) if alive(&w.waiter) => break Some(w),
                Some(_) => debug!("{} skipping abandoned request", address),
                None => break None,
            }
        };
        match next {
            Some(request) => self.admit(address, request),
            None => {
                self.records.remove(&address);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Test waiter: a label plus liveness
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct W(&'static str, bool);

    fn table(policy: ContentionPolicy, round_trip: bool) -> AddressTable<W> {
        AddressTable::new(policy, round_trip, |w: &W| w.1)
    }

    fn granted(actions: &[Action<W>]) -> Vec<(&'static str, ThrottleId)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Grant(g) => Some((g.waiter.0, g.throttle)),
                _ => None,
            })
            .collect()
    }

    const A3: Address = Address::short(3);

    #[test]
    fn test_round_trip_then_grant() {
        let mut t = table(ContentionPolicy::Queue, true);
        let actions = t.request(A3, ShareMode::Exclusive, W("a", true));
        assert!(matches!(actions[..], [Action::SendAcquire { address }] if address == A3));
        assert_eq!(t.status(A3).state, AllocationState::Requesting);

        let binding = Binding {
            address: A3,
            slot: Some(5),
        };
        let actions = t.acquired(A3, binding);
        let grants = granted(&actions);
        assert_eq!(grants.len(), 1);
        assert_eq!(t.status(A3).state, AllocationState::ActiveExclusive);
        assert_eq!(t.binding(A3), Some(binding));
        assert_eq!(t.address_for_slot(5), Some(A3));
    }

    #[test]
    fn test_failed_acquisition_returns_to_free() {
        let mut t = table(ContentionPolicy::Queue, true);
        t.request(A3, ShareMode::Exclusive, W("a", true));
        let actions = t.acquire_failed(A3, "slot in use");
        assert!(matches!(&actions[..], [Action::Refuse { waiter: W("a", _), .. }]));
        assert_eq!(t.status(A3).state, AllocationState::Free);
    }

    #[test]
    fn test_failed_acquisition_admits_next_waiter() {
        let mut t = table(ContentionPolicy::Queue, true);
        t.request(A3, ShareMode::Exclusive, W("a", true));
        t.request(A3, ShareMode::Exclusive, W("b", true));
        let actions = t.acquire_failed(A3, "refused");
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[1], Action::SendAcquire { .. }));
        assert_eq!(t.status(A3).state, AllocationState::Requesting);
    }

    #[test]
    fn test_queue_handoff_after_release() {
        let mut t = table(ContentionPolicy::Queue, false);
        let a = granted(&t.request(A3, ShareMode::Exclusive, W("a", true)))[0].1;
        assert!(t.request(A3, ShareMode::Exclusive, W("b", true)).is_empty());
        assert_eq!(t.status(A3).waiting, 1);

        let actions = t.release(a).unwrap();
        assert!(matches!(actions[..], [Action::SendRelease { .. }]));
        assert_eq!(t.status(A3).state, AllocationState::Releasing);

        let actions = t.released(A3);
        assert_eq!(granted(&actions)[0].0, "b");
        assert_eq!(t.status(A3).state, AllocationState::ActiveExclusive);
        assert_eq!(t.release(a), Err(NotHeld(a)));
    }

    #[test]
    fn test_steal_dispossesses_and_keeps_binding() {
        let mut t = table(ContentionPolicy::Steal, true);
        t.request(A3, ShareMode::Exclusive, W("a", true));
        let binding = Binding {
            address: A3,
            slot: Some(9),
        };
        let a = granted(&t.acquired(A3, binding))[0].1;

        let actions = t.request(A3, ShareMode::Exclusive, W("b", true));
        assert!(matches!(actions[0], Action::Dispossess { throttle, .. } if throttle == a));
        let b = granted(&actions)[0].1;
        assert_eq!(t.status(A3).holders, vec![b]);
        assert_eq!(t.binding(A3), Some(binding));
        assert!(t.lookup(a).is_none());
    }

    #[test]
    fn test_shared_holders_join_without_round_trip() {
        let mut t = table(ContentionPolicy::Queue, true);
        let a7 = Address::short(7);
        t.request(a7, ShareMode::Shared, W("a", true));
        // arrives while the first request is on the wire
        assert!(t.request(a7, ShareMode::Shared, W("b", true)).is_empty());
        let actions = t.acquired(a7, Binding::unslotted(a7));
        assert_eq!(granted(&actions).len(), 2);

        let actions = t.request(a7, ShareMode::Shared, W("c", true));
        assert_eq!(granted(&actions).len(), 1);
        let status = t.status(a7);
        assert_eq!(status.state, AllocationState::ActiveShared(3));
        assert_eq!(status.primary(), Some(status.holders[0]));
    }

    #[test]
    fn test_shared_release_keeps_address_until_last() {
        let mut t = table(ContentionPolicy::Queue, false);
        let a7 = Address::short(7);
        let a = granted(&t.request(a7, ShareMode::Shared, W("a", true)))[0].1;
        let b = granted(&t.request(a7, ShareMode::Shared, W("b", true)))[0].1;
        assert!(t.release(a).unwrap().is_empty());
        assert_eq!(t.status(a7).state, AllocationState::ActiveShared(1));
        assert_eq!(t.status(a7).primary(), Some(b));
        assert!(matches!(
            t.release(b).unwrap()[..],
            [Action::SendRelease { .. }]
        ));
    }

    #[test]
    fn test_exclusive_request_on_shared_address_waits() {
        let mut t = table(ContentionPolicy::Queue, false);
        let a7 = Address::short(7);
        let a = granted(&t.request(a7, ShareMode::Shared, W("a", true)))[0].1;
        assert!(t.request(a7, ShareMode::Exclusive, W("x", true)).is_empty());
        // later shared requests queue behind the exclusive one
        assert!(t.request(a7, ShareMode::Shared, W("s", true)).is_empty());
        t.release(a).unwrap();
        let actions = t.released(a7);
        assert_eq!(granted(&actions)[0].0, "x");
        assert_eq!(t.status(a7).state, AllocationState::ActiveExclusive);
    }

    #[test]
    fn test_dead_waiters_are_skipped() {
        let mut t = table(ContentionPolicy::Queue, false);
        let a = granted(&t.request(A3, ShareMode::Exclusive, W("a", true)))[0].1;
        t.request(A3, ShareMode::Exclusive, W("gone", false));
        t.request(A3, ShareMode::Exclusive, W("c", true));
        t.release(a).unwrap();
        assert_eq!(granted(&t.released(A3))[0].0, "c");
    }

    #[test]
    fn test_release_grace() {
        let mut t = table(ContentionPolicy::Queue, false);
        let a = granted(&t.request(A3, ShareMode::Exclusive, W("a", true)))[0].1;
        t.release(a).unwrap();
        let now = Instant::now();
        t.release_unconfirmed(A3, now, Duration::from_millis(250));
        assert_eq!(
            t.next_grace_deadline(),
            Some(now + Duration::from_millis(250))
        );
        assert!(t.expire_grace(now).is_empty());
        assert_eq!(t.status(A3).state, AllocationState::Releasing);
        t.expire_grace(now + Duration::from_millis(250));
        assert_eq!(t.status(A3).state, AllocationState::Free);
        assert_eq!(t.next_grace_deadline(), None);
    }

    #[test]
    fn test_drain_reports_everyone() {
        let mut t = table(ContentionPolicy::Queue, true);
        t.request(A3, ShareMode::Exclusive, W("a", true));
        t.request(A3, ShareMode::Exclusive, W("b", true));
        let a4 = Address::short(4);
        t.request(a4, ShareMode::Exclusive, W("c", true));
        t.acquired(a4, Binding::unslotted(a4));

        let (holders, waiters) = t.drain();
        assert_eq!(holders.len(), 1);
        assert_eq!(waiters.len(), 2);
        assert_eq!(t.status(A3).state, AllocationState::Free);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request(u8, bool),
        Acquired(u8),
        Failed(u8),
        Release(usize),
        Released(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..4, any::<bool>()).prop_map(|(a, s)| Op::Request(a, s)),
            (1u8..4).prop_map(Op::Acquired),
            (1u8..4).prop_map(Op::Failed),
            (0usize..8).prop_map(Op::Release),
            (1u8..4).prop_map(Op::Released),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_exclusive_holder(
            steal in any::<bool>(),
            round_trip in any::<bool>(),
            ops in proptest::collection::vec(op(), 1..60),
        ) {
            let policy = if steal { ContentionPolicy::Steal } else { ContentionPolicy::Queue };
            let mut t: AddressTable<u32> = AddressTable::new(policy, round_trip, |_| true);
            let mut live: Vec<ThrottleId> = Vec::new();

            for op in ops {
                let actions = match op {
                    Op::Request(n, shared) => {
                        let mode = if shared { ShareMode::Shared } else { ShareMode::Exclusive };
                        t.request(Address::short(n as u16), mode, 0)
                    }
                    Op::Acquired(n) => {
                        let a = Address::short(n as u16);
                        t.acquired(a, Binding { address: a, slot: Some(n) })
                    }
                    Op::Failed(n) => t.acquire_failed(Address::short(n as u16), "nak"),
                    Op::Release(i) if !live.is_empty() => {
                        let id = live.remove(i % live.len());
                        t.release(id).unwrap()
                    }
                    Op::Release(_) => Vec::new(),
                    Op::Released(n) => t.released(Address::short(n as u16)),
                };
                for action in actions {
                    match action {
                        Action::Grant(g) => live.push(g.throttle),
                        Action::Dispossess { throttle, .. } => live.retain(|h| *h != throttle),
                        _ => {}
                    }
                }

                for n in 1u16..4 {
                    let status = t.status(Address::short(n));
                    match status.state {
                        AllocationState::ActiveExclusive => {
                            prop_assert_eq!(status.holders.len(), 1)
                        }
                        AllocationState::ActiveShared(k) => {
                            prop_assert_eq!(status.holders.len(), k);
                            prop_assert!(k >= 1);
                        }
                        _ => prop_assert!(status.holders.is_empty()),
                    }
                }
                // every live handle is known to the table and vice versa
                for id in &live {
                    prop_assert!(t.lookup(*id).is_some());
                }
            }
        }
    }
}
