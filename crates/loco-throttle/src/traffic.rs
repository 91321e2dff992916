//! Outbound traffic control for one connection
//!
//! [`TrafficController`] is the bookkeeping half of the single writer: it
//! orders requests, tracks which are on the wire, matches decoded replies
//! against them and decides when to retransmit or give up. It performs no
//! I/O and never reads the clock itself, so the connection task feeds it
//! the current [`Instant`] and writes whatever it hands back.
//!
//! Each request carries an opaque token `T` that is returned with its
//! [`Completion`], so the owner can route the outcome back to whoever
//! asked.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use loco_protocol::{MatchOutcome, ResponseMatcher, VendorEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::ThrottleError;

/// Queue priority; higher goes first, equal priorities go in admission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Identifies one enqueued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Retry and flow-control parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSettings {
    /// Retransmissions after the first write
    pub max_retries: u32,
    /// Time to wait for a matching reply
    pub timeout: Duration,
    /// Requests allowed on the wire at once
    pub window: usize,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout: Duration::from_millis(500),
            window: 1,
        }
    }
}

impl From<&ConnectionConfig> for TrafficSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout: config.request_timeout(),
            window: config.window_size.max(1),
        }
    }
}

/// Why a request did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// No matching reply after every attempt
    Timeout { attempts: u32 },
    /// The matcher recognized a refusal
    Rejected(String),
    /// The connection closed first
    ConnectionLost,
    /// Withdrawn while still queued
    Cancelled,
}

impl From<Failure> for ThrottleError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Timeout { attempts } => ThrottleError::RequestTimeout { attempts },
            Failure::Rejected(reason) => ThrottleError::CommandRejected(reason),
            Failure::ConnectionLost => ThrottleError::ConnectionLost,
            Failure::Cancelled => ThrottleError::Cancelled,
        }
    }
}

/// Terminal outcome of one request
#[derive(Debug)]
pub struct Completion<T> {
    pub id: RequestId,
    pub token: T,
    pub outcome: Result<(), Failure>,
}

/// Frame the owner must write now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub id: RequestId,
    pub frame: Vec<u8>,
    /// 1 for the first write, 2 for the first retry, and so on
    pub attempt: u32,
}

/// Result of a deadline pass
#[derive(Debug)]
pub struct Expired<T> {
    /// Frames to write again
    pub retransmit: Vec<Transmission>,
    /// Requests that ran out of attempts
    pub failed: Vec<Completion<T>>,
}

/// Enqueue refused because the controller is disconnected; the token is
/// handed back
#[derive(Debug)]
pub struct Closed<T>(pub T);

struct PendingRequest<T> {
    id: RequestId,
    frame: Vec<u8>,
    matcher: Option<ResponseMatcher>,
    attempts: u32,
    deadline: Option<Instant>,
    token: T,
}

type QueueKey = (Reverse<Priority>, u64);

/// Outbound queue, in-flight window and retry bookkeeping
pub struct TrafficController<T> {
    settings: TrafficSettings,
    next_id: u64,
    queue: BTreeMap<QueueKey, PendingRequest<T>>,
    /// Oldest transmission first
    in_flight: Vec<PendingRequest<T>>,
    disconnected: bool,
}

impl<T> TrafficController<T> {
    /// Create a controller
    pub fn new(settings: TrafficSettings) -> Self {
        Self {
            settings,
            next_id: 0,
            queue: BTreeMap::new(),
            in_flight: Vec::new(),
            disconnected: false,
        }
    }

    /// Settings in use
    pub fn settings(&self) -> TrafficSettings {
        self.settings
    }

    /// Accept a request for transmission
    ///
    /// `matcher == None` means the request completes as soon as it is
    /// written.
    pub fn enqueue(
        &mut self,
        frame: Vec<u8>,
        matcher: Option<ResponseMatcher>,
        priority: Priority,
        token: T,
    ) -> Result<RequestId, Closed<T>> {
        if self.disconnected {
            return Err(Closed(token));
        }
        let id = RequestId(self.next_id);
        self.next_id += 1;
        debug!("Enqueued request {} at {:?} priority", id, priority);
        self.queue.insert(
            (Reverse(priority), id.0),
            PendingRequest {
                id,
                frame,
                matcher,
                attempts: 0,
                deadline: None,
                token,
            },
        );
        Ok(id)
    }

    /// Withdraw a request that has not been written yet
    pub fn cancel(&mut self, id: RequestId) -> Option<T> {
        let key = *self.queue.keys().find(|(_, seq)| *seq == id.0)?;
        self.queue.remove(&key).map(|request| {
            debug!("Cancelled request {}", id);
            request.token
        })
    }

    /// Next frame to write, if the window has room
    pub fn next_transmission(&mut self, now: Instant) -> Option<Transmission> {
        if self.disconnected || self.in_flight.len() >= self.settings.window {
            return None;
        }
        let (_, mut request) = self.queue.pop_first()?;
        request.attempts = 1;
        if request.matcher.is_some() {
            request.deadline = Some(now + self.settings.timeout);
        }
        let transmission = Transmission {
            id: request.id,
            frame: request.frame.clone(),
            attempt: 1,
        };
        self.in_flight.push(request);
        Some(transmission)
    }

    /// Record that a frame was written
    ///
    /// Completes requests that expect no reply.
    pub fn on_written(&mut self, id: RequestId) -> Option<Completion<T>> {
        let index = self
            .in_flight
            .iter()
            .position(|r| r.id == id && r.matcher.is_none())?;
        let request = self.in_flight.remove(index);
        Some(Completion {
            id,
            token: request.token,
            outcome: Ok(()),
        })
    }

    /// Offer a decoded event to the in-flight requests, oldest first
    ///
    /// Returns `None` when no request claims it, i.e. the event is
    /// unsolicited.
    pub fn on_event(&mut self, event: &VendorEvent) -> Option<Completion<T>> {
        let (index, outcome) = self.in_flight.iter().enumerate().find_map(|(i, r)| {
            let verdict = r.matcher.as_ref()?.check(event);
            match verdict {
                MatchOutcome::Complete => Some((i, Ok(()))),
                MatchOutcome::Reject(reason) => Some((i, Err(Failure::Rejected(reason)))),
                MatchOutcome::NoMatch => None,
            }
        })?;
        let request = self.in_flight.remove(index);
        debug!(
            "Request {} answered after {} attempt(s): {:?}",
            request.id, request.attempts, outcome
        );
        Some(Completion {
            id: request.id,
            token: request.token,
            outcome,
        })
    }

    /// Earliest reply deadline among in-flight requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.iter().filter_map(|r| r.deadline).min()
    }

    /// Retransmit or fail every request whose deadline has passed
    pub fn on_deadline(&mut self, now: Instant) -> Expired<T> {
        let mut expired = Expired {
            retransmit: Vec::new(),
            failed: Vec::new(),
        };
        let mut i = 0;
        while i < self.in_flight.len() {
            let request = &mut self.in_flight[i];
            let due = matches!(request.deadline, Some(deadline) if deadline <= now);
            if !due {
                i += 1;
                continue;
            }
            if request.attempts > self.settings.max_retries {
                let request = self.in_flight.remove(i);
                warn!(
                    "Request {} failed after {} attempts",
                    request.id, request.attempts
                );
                expired.failed.push(Completion {
                    id: request.id,
                    token: request.token,
                    outcome: Err(Failure::Timeout {
                        attempts: request.attempts,
                    }),
                });
                continue;
            }
            request.attempts += 1;
            request.deadline = Some(now + self.settings.timeout);
            debug!("Retrying request {} (attempt {})", request.id, request.attempts);
            expired.retransmit.push(Transmission {
                id: request.id,
                frame: request.frame.clone(),
                attempt: request.attempts,
            });
            i += 1;
        }
        expired
    }

    /// Enter the terminal disconnected state, failing everything pending
    ///
    /// In-flight requests are reported first, then queued ones in queue
    /// order. Later enqueues are refused.
    pub fn disconnect(&mut self) -> Vec<Completion<T>> {
        self.disconnected = true;
        let queued = std::mem::take(&mut self.queue).into_values();
        self.in_flight
            .drain(..)
            .chain(queued)
            .map(|request| Completion {
                id: request.id,
                token: request.token,
                outcome: Err(Failure::ConnectionLost),
            })
            .collect()
    }

    /// Whether the controller refuses new work
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Requests waiting for transmission
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Requests on the wire
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_protocol::{FaultKind, LocoRef, StateUpdate};
    use proptest::prelude::*;

    fn settings(max_retries: u32, window: usize) -> TrafficSettings {
        TrafficSettings {
            max_retries,
            timeout: Duration::from_millis(100),
            window,
        }
    }

    fn slot_echo(slot: u8) -> VendorEvent {
        VendorEvent::LocoUpdate {
            loco: LocoRef::Slot(slot),
            update: StateUpdate::default(),
        }
    }

    fn slot_matcher(slot: u8) -> Option<ResponseMatcher> {
        Some(ResponseMatcher::new(move |e| match e {
            VendorEvent::LocoUpdate {
                loco: LocoRef::Slot(s),
                ..
            } if *s == slot => MatchOutcome::Complete,
            VendorEvent::Fault(FaultKind::Rejected(r)) => MatchOutcome::Reject(r.clone()),
            _ => MatchOutcome::NoMatch,
        }))
    }

    #[test]
    fn test_priority_then_admission_order() {
        let mut tc = TrafficController::new(settings(0, 8));
        let now = Instant::now();
        tc.enqueue(vec![1], None, Priority::Normal, "a").unwrap();
        tc.enqueue(vec![2], None, Priority::Low, "b").unwrap();
        tc.enqueue(vec![3], None, Priority::High, "c").unwrap();
        tc.enqueue(vec![4], None, Priority::Normal, "d").unwrap();

        let order: Vec<u8> = std::iter::from_fn(|| tc.next_transmission(now))
            .map(|t| t.frame[0])
            .collect();
        assert_eq!(order, vec![3, 1, 4, 2]);
    }

    #[test]
    fn test_window_limits_in_flight() {
        let mut tc = TrafficController::new(settings(0, 1));
        let now = Instant::now();
        tc.enqueue(vec![1], slot_matcher(1), Priority::Normal, 1).unwrap();
        tc.enqueue(vec![2], slot_matcher(2), Priority::Normal, 2).unwrap();

        assert!(tc.next_transmission(now).is_some());
        assert!(tc.next_transmission(now).is_none());
        assert_eq!(tc.in_flight(), 1);
        assert_eq!(tc.queued(), 1);

        let done = tc.on_event(&slot_echo(1)).unwrap();
        assert_eq!(done.token, 1);
        assert!(done.outcome.is_ok());
        assert_eq!(tc.next_transmission(now).unwrap().frame, vec![2]);
    }

    #[test]
    fn test_unmatched_event_is_unsolicited() {
        let mut tc = TrafficController::new(settings(0, 1));
        tc.enqueue(vec![1], slot_matcher(1), Priority::Normal, ())
            .unwrap();
        tc.next_transmission(Instant::now());
        assert!(tc.on_event(&slot_echo(9)).is_none());
        assert_eq!(tc.in_flight(), 1);
    }

    #[test]
    fn test_fire_and_forget_completes_on_write() {
        let mut tc = TrafficController::new(settings(0, 1));
        let id = tc.enqueue(vec![1], None, Priority::Normal, ()).unwrap();
        let t = tc.next_transmission(Instant::now()).unwrap();
        assert_eq!(tc.next_deadline(), None);
        let done = tc.on_written(t.id).unwrap();
        assert_eq!(done.id, id);
        assert!(tc.is_idle());
    }

    #[test]
    fn test_written_does_not_complete_matched_request() {
        let mut tc = TrafficController::new(settings(0, 1));
        tc.enqueue(vec![1], slot_matcher(1), Priority::Normal, ())
            .unwrap();
        let t = tc.next_transmission(Instant::now()).unwrap();
        assert!(tc.on_written(t.id).is_none());
        assert_eq!(tc.in_flight(), 1);
    }

    #[test]
    fn test_retries_then_timeout() {
        let mut tc = TrafficController::new(settings(2, 1));
        let t0 = Instant::now();
        tc.enqueue(vec![0xA0], slot_matcher(1), Priority::Normal, "req")
            .unwrap();
        let first = tc.next_transmission(t0).unwrap();
        assert_eq!(first.attempt, 1);

        let mut writes = 1;
        let mut now;
        let failure = loop {
            now = tc.next_deadline().unwrap();
            let expired = tc.on_deadline(now);
            writes += expired.retransmit.len();
            if let Some(done) = expired.failed.into_iter().next() {
                break done;
            }
        };
        assert_eq!(writes, 3);
        assert_eq!(failure.outcome, Err(Failure::Timeout { attempts: 3 }));
        assert_eq!(now - t0, Duration::from_millis(300));
        assert!(tc.is_idle());
    }

    #[test]
    fn test_deadline_not_due_is_untouched() {
        let mut tc = TrafficController::new(settings(1, 1));
        let t0 = Instant::now();
        tc.enqueue(vec![1], slot_matcher(1), Priority::Normal, ())
            .unwrap();
        tc.next_transmission(t0);
        let expired = tc.on_deadline(t0 + Duration::from_millis(50));
        assert!(expired.retransmit.is_empty());
        assert!(expired.failed.is_empty());
    }

    #[test]
    fn test_reject_fails_without_retry() {
        let mut tc = TrafficController::new(settings(3, 1));
        tc.enqueue(vec![1], slot_matcher(1), Priority::Normal, ())
            .unwrap();
        tc.next_transmission(Instant::now());
        let done = tc
            .on_event(&VendorEvent::Fault(FaultKind::Rejected("busy".into())))
            .unwrap();
        assert_eq!(done.outcome, Err(Failure::Rejected("busy".into())));
        assert!(tc.is_idle());
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let mut tc = TrafficController::new(settings(0, 1));
        let a = tc.enqueue(vec![1], slot_matcher(1), Priority::Normal, "a").unwrap();
        let b = tc.enqueue(vec![2], slot_matcher(2), Priority::Normal, "b").unwrap();
        tc.next_transmission(Instant::now());

        assert_eq!(tc.cancel(a), None);
        assert_eq!(tc.cancel(b), Some("b"));
        assert_eq!(tc.cancel(b), None);
        assert_eq!(tc.queued(), 0);
    }

    #[test]
    fn test_disconnect_fails_everything_and_refuses_enqueue() {
        let mut tc = TrafficController::new(settings(0, 1));
        for n in 0..3u8 {
            tc.enqueue(vec![n], slot_matcher(n), Priority::Normal, n)
                .unwrap();
        }
        tc.next_transmission(Instant::now());

        let failed = tc.disconnect();
        let tokens: Vec<u8> = failed.iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec![0, 1, 2]);
        assert!(failed
            .iter()
            .all(|c| c.outcome == Err(Failure::ConnectionLost)));

        let refused = tc.enqueue(vec![9], None, Priority::High, 9).unwrap_err();
        assert_eq!(refused.0, 9);
        assert!(tc.next_transmission(Instant::now()).is_none());
    }

    proptest! {
        #[test]
        fn writes_never_exceed_retry_bound(
            max_retries in 0u32..6,
            window in 1usize..4,
            requests in 1usize..6,
            answered in proptest::collection::vec(any::<bool>(), 6),
        ) {
            let mut tc = TrafficController::new(settings(max_retries, window));
            let mut now = Instant::now();
            let mut writes = vec![0u32; requests];
            let mut outcomes = vec![0u32; requests];

            for n in 0..requests {
                tc.enqueue(vec![n as u8], slot_matcher(n as u8), Priority::Normal, n).unwrap();
            }

            // Drive until idle, answering some requests on their first write
            for _ in 0..1000 {
                while let Some(t) = tc.next_transmission(now) {
                    let n = t.frame[0] as usize;
                    writes[n] += 1;
                    if answered[n] {
                        let done = tc.on_event(&slot_echo(n as u8)).unwrap();
                        prop_assert!(done.outcome.is_ok());
                        outcomes[done.token] += 1;
                    }
                }
                let Some(deadline) = tc.next_deadline() else { break };
                now = deadline;
                let expired = tc.on_deadline(now);
                for t in expired.retransmit {
                    writes[t.frame[0] as usize] += 1;
                }
                for done in expired.failed {
                    prop_assert_eq!(
                        done.outcome,
                        Err(Failure::Timeout { attempts: max_retries + 1 })
                    );
                    outcomes[done.token] += 1;
                }
            }

            prop_assert!(tc.is_idle());
            for n in 0..requests {
                prop_assert!(writes[n] <= max_retries + 1);
                // every request is reported exactly once
                prop_assert_eq!(outcomes[n], 1);
            }
        }
    }
}
