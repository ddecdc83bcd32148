//! Work distribution
//!
//! The requester asks each neighbour how many values it can take, hands out
//! slices of the range as availabilities come back, and keeps whatever is
//! left for itself. Every checked value travels back as a `WorkResponse`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::routes::RoutingTable;
use super::session::SessionHandle;
use super::{OverlayError, OverlayResult, ProtocolState};
use crate::protocol::{
    CheckerRef, Id, Packet, Range, Response, WorkAssignment, WorkAvailability, WorkPacket,
    WorkRequest, WorkResponse,
};
use crate::worker::{ResultSink, Task, WorkExecutor, WorkOutcome};

/// An offer nobody assigned work against within this long is dropped.
///
/// A requester that ran out of values before our availability arrived never
/// sends the matching assignment.
const PENDING_TTL: Duration = Duration::from_secs(60);

/// How many values this node accepts from a requester.
#[derive(Debug, Clone, Copy)]
pub struct CapacityPolicy {
    max_in_flight: u64,
}

impl CapacityPolicy {
    pub fn new(max_in_flight: u64) -> Self {
        Self { max_in_flight }
    }

    pub fn capacity(&self, in_flight: u64, requested: u64) -> u64 {
        requested.min(self.max_in_flight.saturating_sub(in_flight))
    }
}

/// A range being checked on behalf of a local `start` command
#[derive(Debug)]
struct Distribution {
    checker: CheckerRef,
    total: u64,
    received: u64,
    remaining: Option<Range>,
    awaiting: HashSet<Id>,
}

/// Local work to start
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub checker: CheckerRef,
    pub range: Range,
    pub output: Option<PathBuf>,
}

/// Both halves of the work protocol: requester and worker
pub struct Dispatcher {
    policy: CapacityPolicy,
    executor: WorkExecutor,
    sink: Box<dyn ResultSink>,
    /// Requests we offered capacity for, by requester and request id
    pending: HashMap<(Id, u64), (WorkRequest, Instant)>,
    in_flight: u64,
    distributions: HashMap<u64, Distribution>,
    last_request_id: u64,
}

impl Dispatcher {
    pub fn new(policy: CapacityPolicy, executor: WorkExecutor, sink: Box<dyn ResultSink>) -> Self {
        Self {
            policy,
            executor,
            sink,
            pending: HashMap::new(),
            in_flight: 0,
            distributions: HashMap::new(),
            last_request_id: 0,
        }
    }

    /// Values currently submitted to the executor.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Whether `request_id` still expects responses.
    pub fn is_active(&self, request_id: u64) -> bool {
        self.distributions.contains_key(&request_id)
    }

    /// Apply one work-family packet received on `session`.
    pub fn process(
        &mut self,
        session: &SessionHandle,
        packet: WorkPacket,
        routes: &mut RoutingTable,
        state: ProtocolState,
    ) -> OverlayResult<ProtocolState> {
        let me = routes.me();
        let dest = packet.dest();
        if dest != me {
            if !routes.send_to(dest, packet) {
                tracing::warn!("No route towards {}, work packet dropped", dest);
            }
            return Ok(state);
        }

        match packet {
            WorkPacket::Request(request) => {
                self.expire_pending(Instant::now());
                let capacity = if state == ProtocolState::Disconnecting {
                    0
                } else {
                    self.policy.capacity(self.in_flight, request.wanted)
                };
                let availability = WorkAvailability {
                    dest: request.src,
                    src: me,
                    request_id: request.request_id,
                    capacity,
                };
                reply(session, routes, request.src, availability.into())?;
                tracing::debug!(
                    "Offered {} value(s) to request {} of {}",
                    capacity,
                    request.request_id,
                    request.src
                );

                if capacity == 0 {
                    return Ok(ProtocolState::RequestDenied);
                }
                self.pending
                    .insert((request.src, request.request_id), (request, Instant::now()));
                Ok(ProtocolState::RequestAccepted)
            }
            WorkPacket::Availability(availability) => {
                self.on_availability(session, availability, routes)
            }
            WorkPacket::Assignment(assignment) => {
                self.on_assignment(assignment)?;
                Ok(ProtocolState::Computing)
            }
            WorkPacket::Response(response) => {
                self.record(response.request_id, &response.response);
                Ok(ProtocolState::ReceivedWorkResponse)
            }
        }
    }

    fn on_availability(
        &mut self,
        session: &SessionHandle,
        availability: WorkAvailability,
        routes: &RoutingTable,
    ) -> OverlayResult<ProtocolState> {
        let me = routes.me();
        let request_id = availability.request_id;
        let Some(distribution) = self.distributions.get_mut(&request_id) else {
            tracing::warn!("Availability for unknown request {}", request_id);
            return Ok(ProtocolState::RequestDenied);
        };
        distribution.awaiting.remove(&availability.src);

        let mut next = ProtocolState::RequestDenied;
        let carved = distribution
            .remaining
            .and_then(|remaining| remaining.split(availability.capacity));
        if let Some((head, tail)) = carved {
            distribution.remaining = tail;
            let assignment = WorkAssignment {
                dest: availability.src,
                src: me,
                request_id,
                range: head,
            };
            reply(session, routes, availability.src, assignment.into())?;
            tracing::info!("Assigned {} of request {} to {}", head, request_id, availability.src);
            next = ProtocolState::WorkSubmitted;
        }

        if distribution.awaiting.is_empty() {
            self.run_leftover(request_id, me);
        }
        Ok(next)
    }

    fn on_assignment(&mut self, assignment: WorkAssignment) -> OverlayResult<()> {
        let key = (assignment.src, assignment.request_id);
        let Some((request, _)) = self.pending.remove(&key) else {
            return Err(OverlayError::ProtocolViolation(format!(
                "assignment {} from {} without a matching request",
                assignment.request_id, assignment.src
            )));
        };
        let range = assignment.range;
        if range.inf() < request.range.inf() || range.sup() > request.range.sup() {
            return Err(OverlayError::ProtocolViolation(format!(
                "assigned {} lies outside requested {}",
                range, request.range
            )));
        }

        tracing::info!("Computing {} for {}", range, request.src);
        self.submit(Task {
            requester: request.src,
            request_id: request.request_id,
            checker: request.checker,
            range,
        });
        Ok(())
    }

    fn expire_pending(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending
            .retain(|_, (_, offered)| now.saturating_duration_since(*offered) < PENDING_TTL);
        let expired = before - self.pending.len();
        if expired > 0 {
            tracing::debug!("Dropped {} unanswered offer(s)", expired);
        }
    }

    /// Start checking `start.range`, sharing it with the neighbours.
    pub fn start(&mut self, start: StartRequest, routes: &RoutingTable) -> u64 {
        let request_id = self.next_request_id();
        let me = routes.me();
        if let Some(output) = start.output {
            self.sink.register(request_id, output);
        }

        let neighbours = routes.neighbours();
        let total = start.range.len();
        self.distributions.insert(
            request_id,
            Distribution {
                checker: start.checker.clone(),
                total,
                received: 0,
                remaining: Some(start.range),
                awaiting: neighbours.iter().copied().collect(),
            },
        );
        tracing::info!(
            "Request {}: {} over {} with {} neighbour(s)",
            request_id,
            start.checker,
            start.range,
            neighbours.len()
        );

        if neighbours.is_empty() {
            self.run_leftover(request_id, me);
            return request_id;
        }

        let wanted = total.div_ceil(neighbours.len() as u64);
        for neighbour in neighbours {
            let request = WorkRequest {
                dest: neighbour,
                src: me,
                request_id,
                checker: start.checker.clone(),
                range: start.range,
                wanted,
            };
            if !routes.send_to(neighbour, WorkPacket::Request(request)) {
                self.forget(neighbour, routes);
            }
        }
        request_id
    }

    /// Stop waiting on `peer`; its share goes back to the local pool.
    pub fn forget(&mut self, peer: Id, routes: &RoutingTable) {
        let me = routes.me();
        let mut ready = Vec::new();
        for (request_id, distribution) in self.distributions.iter_mut() {
            if distribution.awaiting.remove(&peer) && distribution.awaiting.is_empty() {
                ready.push(*request_id);
            }
        }
        for request_id in ready {
            self.run_leftover(request_id, me);
        }
        self.pending.retain(|(requester, _), _| *requester != peer);
    }

    /// Route the verdicts of a finished batch back to its requester.
    pub fn on_outcome(&mut self, outcome: WorkOutcome, routes: &RoutingTable) {
        let task = outcome.task;
        self.in_flight = self.in_flight.saturating_sub(task.range.len());
        let me = routes.me();

        for response in outcome.responses {
            if task.requester == me {
                self.record(task.request_id, &response);
                continue;
            }
            let packet = Packet::from(WorkPacket::Response(WorkResponse {
                dest: task.requester,
                src: me,
                request_id: task.request_id,
                response,
            }));
            if !routes.send_to(task.requester, packet.clone())
                && !routes.send_to(routes.mother(), packet)
            {
                tracing::warn!(
                    "Response for request {} lost, no way to {}",
                    task.request_id,
                    task.requester
                );
            }
        }
    }

    fn run_leftover(&mut self, request_id: u64, me: Id) {
        let Some(distribution) = self.distributions.get_mut(&request_id) else {
            return;
        };
        let Some(range) = distribution.remaining.take() else {
            return;
        };
        tracing::info!("Checking {} of request {} locally", range, request_id);
        let task = Task {
            requester: me,
            request_id,
            checker: distribution.checker.clone(),
            range,
        };
        self.submit(task);
    }

    fn submit(&mut self, task: Task) {
        self.in_flight = self.in_flight.saturating_add(task.range.len());
        self.executor.submit(task);
    }

    fn record(&mut self, request_id: u64, response: &Response) {
        if let Err(e) = self.sink.record(request_id, response) {
            tracing::error!("Failed to record result of request {}: {}", request_id, e);
        }
        let Some(distribution) = self.distributions.get_mut(&request_id) else {
            tracing::debug!("Response for request {} arrived after completion", request_id);
            return;
        };
        distribution.received += 1;
        if distribution.received >= distribution.total {
            tracing::info!("Request {} complete: {} value(s)", request_id, distribution.total);
            self.distributions.remove(&request_id);
        }
    }

    fn next_request_id(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut id = now.max(self.last_request_id.saturating_add(1));
        while self.distributions.contains_key(&id) {
            id += 1;
        }
        self.last_request_id = id;
        id
    }
}

/// Send towards `dest`, or back on `session` when there is no route yet.
fn reply(
    session: &SessionHandle,
    routes: &RoutingTable,
    dest: Id,
    packet: Packet,
) -> OverlayResult<()> {
    if routes.send_to(dest, packet.clone()) {
        return Ok(());
    }
    session.send(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::Outbound;
    use crate::protocol::ResponseStatus;
    use crate::worker::{ExecutorConfig, FileSink, Registry, BUILTIN_LOCATOR};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn id(port: u16) -> Id {
        Id::new(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(Outbound::Packet(p)) = rx.try_recv() {
            packets.push(p);
        }
        packets
    }

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<(u64, Response)>>>);

    impl ResultSink for MemorySink {
        fn register(&mut self, _: u64, _: PathBuf) {}

        fn record(&mut self, request_id: u64, response: &Response) -> std::io::Result<()> {
            if let Ok(mut recorded) = self.0.lock() {
                recorded.push((request_id, response.clone()));
            }
            Ok(())
        }
    }

    fn dispatcher(
        max_in_flight: u64,
        sink: Box<dyn ResultSink>,
    ) -> (Dispatcher, mpsc::UnboundedReceiver<WorkOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = WorkExecutor::new(
            ExecutorConfig {
                pool_size: 2,
                deadline: Duration::from_secs(5),
            },
            Arc::new(Registry::new()),
            tx,
        );
        (
            Dispatcher::new(CapacityPolicy::new(max_in_flight), executor, sink),
            rx,
        )
    }

    fn prime() -> CheckerRef {
        CheckerRef::new(BUILTIN_LOCATOR, "prime")
    }

    fn request(dest: Id, src: Id, wanted: u64) -> WorkRequest {
        WorkRequest {
            dest,
            src,
            request_id: 9,
            checker: prime(),
            range: Range::new(0, 99).unwrap(),
            wanted,
        }
    }

    #[test]
    fn test_capacity_policy() {
        let policy = CapacityPolicy::new(10);
        assert_eq!(policy.capacity(0, 4), 4);
        assert_eq!(policy.capacity(8, 4), 2);
        assert_eq!(policy.capacity(12, 4), 0);
        assert_eq!(policy.capacity(0, 0), 0);
    }

    #[test]
    fn test_forwarding_keeps_packet_and_state() {
        let (mut work, _outcomes) = dispatcher(10, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, mut up_rx) = SessionHandle::channel();
        let (down, mut down_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);
        routes.add(id(3), id(3), &down);

        let packet = WorkPacket::Request(request(id(3), id(1), 5));
        let state = work
            .process(&up, packet.clone(), &mut routes, ProtocolState::Connected)
            .unwrap();

        assert_eq!(state, ProtocolState::Connected);
        assert!(drain(&mut up_rx).is_empty());
        assert_eq!(drain(&mut down_rx), vec![Packet::from(packet)]);
    }

    #[test]
    fn test_request_answered_with_capacity() {
        let (mut work, _outcomes) = dispatcher(3, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, mut up_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);

        let state = work
            .process(
                &up,
                WorkPacket::Request(request(id(2), id(1), 5)),
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();

        assert_eq!(state, ProtocolState::RequestAccepted);
        assert_eq!(
            drain(&mut up_rx),
            vec![Packet::from(WorkPacket::Availability(WorkAvailability {
                dest: id(1),
                src: id(2),
                request_id: 9,
                capacity: 3,
            }))]
        );
    }

    #[test]
    fn test_request_denied_while_leaving() {
        let (mut work, _outcomes) = dispatcher(3, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, mut up_rx) = SessionHandle::channel();

        let state = work
            .process(
                &up,
                WorkPacket::Request(request(id(2), id(1), 5)),
                &mut routes,
                ProtocolState::Disconnecting,
            )
            .unwrap();

        assert_eq!(state, ProtocolState::RequestDenied);
        assert!(matches!(
            drain(&mut up_rx).as_slice(),
            [Packet::Work(WorkPacket::Availability(WorkAvailability { capacity: 0, .. }))]
        ));
    }

    #[test]
    fn test_unexpected_assignment_is_fatal() {
        let (mut work, _outcomes) = dispatcher(3, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, _rx) = SessionHandle::channel();

        let err = work
            .process(
                &up,
                WorkPacket::Assignment(WorkAssignment {
                    dest: id(2),
                    src: id(1),
                    request_id: 4,
                    range: Range::new(0, 1).unwrap(),
                }),
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_assignment_runs_and_responds() {
        let (mut work, mut outcomes) = dispatcher(10, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, mut up_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);
        routes.set_mother(id(1));

        work.process(
            &up,
            WorkPacket::Request(request(id(2), id(1), 5)),
            &mut routes,
            ProtocolState::Connected,
        )
        .unwrap();
        let state = work
            .process(
                &up,
                WorkPacket::Assignment(WorkAssignment {
                    dest: id(2),
                    src: id(1),
                    request_id: 9,
                    range: Range::new(2, 4).unwrap(),
                }),
                &mut routes,
                ProtocolState::RequestAccepted,
            )
            .unwrap();
        assert_eq!(state, ProtocolState::Computing);
        assert_eq!(work.in_flight(), 3);
        drain(&mut up_rx);

        let outcome = outcomes.recv().await.unwrap();
        work.on_outcome(outcome, &routes);
        assert_eq!(work.in_flight(), 0);

        let responses: Vec<Response> = drain(&mut up_rx)
            .into_iter()
            .filter_map(|p| match p {
                Packet::Work(WorkPacket::Response(r)) => {
                    assert_eq!((r.dest, r.src, r.request_id), (id(1), id(2), 9));
                    Some(r.response)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            responses,
            vec![
                Response::done(2, "2 is prime"),
                Response::done(3, "3 is prime"),
                Response::done(4, "4 is not prime"),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_splits_between_neighbours_and_self() {
        let sink = MemorySink::default();
        let (mut work, mut outcomes) = dispatcher(10, Box::new(sink.clone()));
        let mut routes = RoutingTable::new(id(1));
        let (a, mut a_rx) = SessionHandle::channel();
        let (b, mut b_rx) = SessionHandle::channel();
        routes.add(id(2), id(2), &a);
        routes.add(id(3), id(3), &b);

        let request_id = work.start(
            StartRequest {
                checker: prime(),
                range: Range::new(0, 9).unwrap(),
                output: None,
            },
            &routes,
        );
        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                drain(rx).as_slice(),
                [Packet::Work(WorkPacket::Request(WorkRequest { wanted: 5, .. }))]
            ));
        }

        let state = work
            .process(
                &a,
                WorkPacket::Availability(WorkAvailability {
                    dest: id(1),
                    src: id(2),
                    request_id,
                    capacity: 4,
                }),
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();
        assert_eq!(state, ProtocolState::WorkSubmitted);
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [Packet::Work(WorkPacket::Assignment(WorkAssignment { range, .. }))]
                if *range == Range::new(0, 3).unwrap()
        ));

        let state = work
            .process(
                &b,
                WorkPacket::Availability(WorkAvailability {
                    dest: id(1),
                    src: id(3),
                    request_id,
                    capacity: 0,
                }),
                &mut routes,
                ProtocolState::Connected,
            )
            .unwrap();
        assert_eq!(state, ProtocolState::RequestDenied);
        assert!(drain(&mut b_rx).is_empty());

        // [4, 9] is left for us
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.task.range, Range::new(4, 9).unwrap());
        work.on_outcome(outcome, &routes);
        assert_eq!(sink.0.lock().unwrap().len(), 6);
        assert!(work.is_active(request_id));

        for value in 0..=3 {
            work.process(
                &a,
                WorkPacket::Response(WorkResponse {
                    dest: id(1),
                    src: id(2),
                    request_id,
                    response: Response::done(value, "ok"),
                }),
                &mut routes,
                ProtocolState::WorkSubmitted,
            )
            .unwrap();
        }
        assert!(!work.is_active(request_id));
        assert_eq!(sink.0.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_start_alone_writes_results() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("primes.txt");
        let (mut work, mut outcomes) = dispatcher(10, Box::new(FileSink::new(dir.path())));
        let routes = RoutingTable::new(id(1));

        work.start(
            StartRequest {
                checker: prime(),
                range: Range::new(5, 7).unwrap(),
                output: Some(output.clone()),
            },
            &routes,
        );
        let outcome = outcomes.recv().await.unwrap();
        assert!(outcome.responses.iter().all(|r| r.status == ResponseStatus::Done));
        work.on_outcome(outcome, &routes);

        assert_eq!(
            std::fs::read_to_string(output).unwrap(),
            "5 done 5 is prime\n6 done 6 is not prime\n7 done 7 is prime\n"
        );
    }

    #[test]
    fn test_unused_offer_expires() {
        let (mut work, _outcomes) = dispatcher(10, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, _up_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);

        work.process(
            &up,
            WorkPacket::Request(request(id(2), id(1), 1)),
            &mut routes,
            ProtocolState::Connected,
        )
        .unwrap();
        assert_eq!(work.pending.len(), 1);

        work.expire_pending(Instant::now());
        assert_eq!(work.pending.len(), 1);

        work.expire_pending(Instant::now() + PENDING_TTL + Duration::from_secs(1));
        assert!(work.pending.is_empty());

        // A late assignment is now unexpected
        let err = work
            .process(
                &up,
                WorkPacket::Assignment(WorkAssignment {
                    dest: id(2),
                    src: id(1),
                    request_id: 9,
                    range: Range::new(0, 0).unwrap(),
                }),
                &mut routes,
                ProtocolState::RequestAccepted,
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_exhausted_range_sends_no_assignment() {
        let (mut work, _outcomes) = dispatcher(10, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(1));
        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for port in [2, 3, 4] {
            let (handle, rx) = SessionHandle::channel();
            routes.add(id(port), id(port), &handle);
            handles.push(handle);
            receivers.push(rx);
        }

        let request_id = work.start(
            StartRequest {
                checker: prime(),
                range: Range::new(0, 1).unwrap(),
                output: None,
            },
            &routes,
        );
        for rx in &mut receivers {
            drain(rx);
        }

        let mut states = Vec::new();
        for (port, handle) in [2, 3, 4].into_iter().zip(&handles) {
            states.push(
                work.process(
                    handle,
                    WorkPacket::Availability(WorkAvailability {
                        dest: id(1),
                        src: id(port),
                        request_id,
                        capacity: 1,
                    }),
                    &mut routes,
                    ProtocolState::Connected,
                )
                .unwrap(),
            );
        }
        assert_eq!(
            states,
            vec![
                ProtocolState::WorkSubmitted,
                ProtocolState::WorkSubmitted,
                ProtocolState::RequestDenied,
            ]
        );
        assert_eq!(drain(&mut receivers[0]).len(), 1);
        assert_eq!(drain(&mut receivers[1]).len(), 1);
        assert!(drain(&mut receivers[2]).is_empty());
    }

    #[tokio::test]
    async fn test_response_falls_back_to_mother() {
        let (mut work, mut outcomes) = dispatcher(10, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(2));
        let (up, mut up_rx) = SessionHandle::channel();
        let (down, mut down_rx) = SessionHandle::channel();
        routes.add(id(1), id(1), &up);
        routes.set_mother(id(1));
        routes.add(id(5), id(5), &down);

        work.process(
            &down,
            WorkPacket::Request(request(id(2), id(5), 5)),
            &mut routes,
            ProtocolState::Connected,
        )
        .unwrap();
        work.process(
            &down,
            WorkPacket::Assignment(WorkAssignment {
                dest: id(2),
                src: id(5),
                request_id: 9,
                range: Range::new(7, 8).unwrap(),
            }),
            &mut routes,
            ProtocolState::RequestAccepted,
        )
        .unwrap();
        drain(&mut down_rx);

        // The direct link to the requester goes away mid-computation
        routes.detach(down.id());
        let outcome = outcomes.recv().await.unwrap();
        work.on_outcome(outcome, &routes);

        assert!(drain(&mut down_rx).is_empty());
        let responses: Vec<(Id, i64)> = drain(&mut up_rx)
            .into_iter()
            .filter_map(|p| match p {
                Packet::Work(WorkPacket::Response(r)) => Some((r.dest, r.response.value)),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![(id(5), 7), (id(5), 8)]);
    }

    #[tokio::test]
    async fn test_forget_releases_leftover() {
        let (mut work, mut outcomes) = dispatcher(10, Box::new(MemorySink::default()));
        let mut routes = RoutingTable::new(id(1));
        let (a, _a_rx) = SessionHandle::channel();
        routes.add(id(2), id(2), &a);

        work.start(
            StartRequest {
                checker: prime(),
                range: Range::new(0, 1).unwrap(),
                output: None,
            },
            &routes,
        );
        work.forget(id(2), &routes);

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.task.range, Range::new(0, 1).unwrap());
        assert_eq!(outcome.task.requester, id(1));
    }
}
