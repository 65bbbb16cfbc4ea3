//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Link lifecycle as a pure state machine.
//!
//! ```text
//! Disconnected --connect--> Connecting --suback--> Connected
//!      ^                        |                     |
//!      |                   fail/drop                drop
//!      |                        v                     v
//!      +------ disconnect ---- any ----- drop --> Backoff(n) --n > max--> Exhausted
//! ```
use serde::Serialize;

/// Lifecycle phase of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "attempts", rename_all = "snake_case")]
pub enum LinkPhase {
    /// No socket.
    Disconnected,
    /// First handshake in flight; `connect()` callers are waiting.
    Connecting,
    /// Subscriptions acknowledged.
    Connected,
    /// Session dropped; the transport is redialling. Carries the attempt count.
    Backoff(u32),
    /// Reconnect ceiling exceeded; socket closed until `connect()` is called.
    Exhausted(u32),
}

/// Stimulus driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    /// `connect()` called.
    ConnectRequested,
    /// Transport completed its handshake.
    TransportConnected,
    /// Broker acknowledged the subscriptions.
    SubscriptionsAcknowledged,
    /// An established session was lost.
    TransportDropped,
    /// Transport failed before a session existed.
    TransportFailed,
    /// `disconnect()` called.
    DisconnectRequested,
}

/// Side effect the manager must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Nothing to do.
    None,
    /// Open a transport connection.
    OpenSocket,
    /// Subscribe to the telemetry and SOS topics.
    Subscribe,
    /// Settle pending `connect()` callers successfully.
    ResolveConnect,
    /// Close the socket and fail pending `connect()` callers.
    FailConnect,
    /// A reconnected session is healthy again; the attempt counter was reset.
    Restored,
    /// Wait for the transport's next redial; carries the attempt number.
    AwaitRedial(u32),
    /// Attempts exhausted; close the socket for good.
    GiveUp,
    /// Close the socket on request.
    CloseSocket,
}

/// Compute the next phase. `max_attempts` is the number of redials tolerated
/// after a drop before the link gives up.
pub fn transition(phase: LinkPhase, input: LinkInput, max_attempts: u32) -> (LinkPhase, LinkAction) {
    use LinkAction as A;
    use LinkInput as I;
    use LinkPhase as P;

    match (phase, input) {
        (P::Disconnected | P::Exhausted(_), I::ConnectRequested) => (P::Connecting, A::OpenSocket),
        (_, I::ConnectRequested) => (phase, A::None),

        (P::Disconnected, I::DisconnectRequested) => (P::Disconnected, A::None),
        (_, I::DisconnectRequested) => (P::Disconnected, A::CloseSocket),

        // Anything the transport says after teardown belongs to a dead socket.
        (P::Disconnected | P::Exhausted(_), _) => (phase, A::None),

        (_, I::TransportConnected) => (phase, A::Subscribe),

        (P::Connecting, I::SubscriptionsAcknowledged) => (P::Connected, A::ResolveConnect),
        (P::Backoff(_), I::SubscriptionsAcknowledged) => (P::Connected, A::Restored),
        (P::Connected, I::SubscriptionsAcknowledged) => (P::Connected, A::None),

        (P::Connecting, I::TransportDropped | I::TransportFailed) => {
            (P::Disconnected, A::FailConnect)
        }
        (P::Connected, I::TransportDropped | I::TransportFailed) => redial(1, max_attempts),
        (P::Backoff(n), I::TransportDropped | I::TransportFailed) => {
            redial(n.saturating_add(1), max_attempts)
        }
    }
}

fn redial(attempt: u32, max_attempts: u32) -> (LinkPhase, LinkAction) {
    if attempt > max_attempts {
        (LinkPhase::Exhausted(attempt), LinkAction::GiveUp)
    } else {
        (LinkPhase::Backoff(attempt), LinkAction::AwaitRedial(attempt))
    }
}

/// Point-in-time view of the link, safe to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// Subscriptions are live.
    pub connected: bool,
    /// A handshake or redial is in progress.
    pub connecting: bool,
    /// Consecutive redials since the session was last healthy.
    pub reconnect_attempts: u32,
    /// The link gave up after too many redials.
    pub exhausted: bool,
    /// Underlying phase.
    pub phase: LinkPhase,
}

impl LinkPhase {
    /// Project the phase into a status snapshot.
    pub fn status(&self) -> LinkStatus {
        let (connected, connecting, reconnect_attempts, exhausted) = match *self {
            LinkPhase::Disconnected => (false, false, 0, false),
            LinkPhase::Connecting => (false, true, 0, false),
            LinkPhase::Connected => (true, false, 0, false),
            LinkPhase::Backoff(n) => (false, true, n, false),
            LinkPhase::Exhausted(n) => (false, false, n, true),
        };
        LinkStatus {
            connected,
            connecting,
            reconnect_attempts,
            exhausted,
            phase: *self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 3;

    fn run(inputs: &[LinkInput]) -> (LinkPhase, Vec<LinkAction>) {
        let mut phase = LinkPhase::Disconnected;
        let mut actions = Vec::new();
        for input in inputs {
            let (next, action) = transition(phase, *input, MAX);
            phase = next;
            actions.push(action);
        }
        (phase, actions)
    }

    #[test]
    fn happy_path_reaches_connected() {
        let (phase, actions) = run(&[
            LinkInput::ConnectRequested,
            LinkInput::TransportConnected,
            LinkInput::SubscriptionsAcknowledged,
        ]);
        assert_eq!(phase, LinkPhase::Connected);
        assert_eq!(
            actions,
            vec![LinkAction::OpenSocket, LinkAction::Subscribe, LinkAction::ResolveConnect]
        );
        assert!(phase.status().connected);
    }

    #[test]
    fn connect_is_idempotent_while_in_flight_or_up() {
        for phase in [LinkPhase::Connecting, LinkPhase::Connected, LinkPhase::Backoff(2)] {
            assert_eq!(
                transition(phase, LinkInput::ConnectRequested, MAX),
                (phase, LinkAction::None)
            );
        }
    }

    #[test]
    fn failure_before_session_fails_connect() {
        let (phase, actions) = run(&[LinkInput::ConnectRequested, LinkInput::TransportFailed]);
        assert_eq!(phase, LinkPhase::Disconnected);
        assert_eq!(actions.last(), Some(&LinkAction::FailConnect));
    }

    #[test]
    fn drops_beyond_ceiling_exhaust_the_link() {
        let mut inputs = vec![
            LinkInput::ConnectRequested,
            LinkInput::TransportConnected,
            LinkInput::SubscriptionsAcknowledged,
        ];
        inputs.extend(std::iter::repeat(LinkInput::TransportDropped).take(MAX as usize));
        let (phase, actions) = run(&inputs);
        assert_eq!(phase, LinkPhase::Backoff(MAX));
        assert_eq!(actions.last(), Some(&LinkAction::AwaitRedial(MAX)));
        assert_eq!(phase.status().reconnect_attempts, MAX);

        let (phase, action) = transition(phase, LinkInput::TransportFailed, MAX);
        assert_eq!(phase, LinkPhase::Exhausted(MAX + 1));
        assert_eq!(action, LinkAction::GiveUp);
        let status = phase.status();
        assert!(!status.connected);
        assert!(!status.connecting);
        assert!(status.exhausted);

        // Late transport chatter is ignored once exhausted.
        assert_eq!(
            transition(phase, LinkInput::TransportConnected, MAX),
            (phase, LinkAction::None)
        );
    }

    #[test]
    fn healthy_redial_resets_the_counter() {
        let (phase, actions) = run(&[
            LinkInput::ConnectRequested,
            LinkInput::TransportConnected,
            LinkInput::SubscriptionsAcknowledged,
            LinkInput::TransportDropped,
            LinkInput::TransportFailed,
            LinkInput::TransportConnected,
            LinkInput::SubscriptionsAcknowledged,
            LinkInput::TransportDropped,
        ]);
        assert_eq!(phase, LinkPhase::Backoff(1));
        assert!(actions.contains(&LinkAction::Restored));
    }

    #[test]
    fn disconnect_is_terminal_from_any_phase() {
        for phase in [
            LinkPhase::Connecting,
            LinkPhase::Connected,
            LinkPhase::Backoff(1),
            LinkPhase::Exhausted(4),
        ] {
            assert_eq!(
                transition(phase, LinkInput::DisconnectRequested, MAX),
                (LinkPhase::Disconnected, LinkAction::CloseSocket)
            );
        }
        assert_eq!(
            transition(LinkPhase::Disconnected, LinkInput::DisconnectRequested, MAX),
            (LinkPhase::Disconnected, LinkAction::None)
        );
        assert_eq!(
            transition(LinkPhase::Exhausted(4), LinkInput::ConnectRequested, MAX),
            (LinkPhase::Connecting, LinkAction::OpenSocket)
        );
    }

    #[test]
    fn status_serialises_for_dashboards() {
        let idle = serde_json::to_value(LinkPhase::Disconnected.status()).expect("serialises");
        assert_eq!(
            idle,
            serde_json::json!({
                "connected": false,
                "connecting": false,
                "reconnect_attempts": 0,
                "exhausted": false,
                "phase": { "phase": "disconnected" },
            })
        );

        let redialling = serde_json::to_value(LinkPhase::Backoff(2).status()).expect("serialises");
        assert_eq!(redialling["connecting"], true);
        assert_eq!(redialling["reconnect_attempts"], 2);
        assert_eq!(
            redialling["phase"],
            serde_json::json!({ "phase": "backoff", "attempts": 2 })
        );
    }
}
