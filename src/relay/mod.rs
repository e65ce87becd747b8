use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::RelayError,
    events::{EventBus, RelayEvent},
    serial::{frame::RelayFrame, LinkState, SerialLink},
};

/// Where a circuit's relay physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEndpoint {
    pub circuit_id: String,
    pub board_id: String,
    pub channel: u8,
}

/// What we last asked a relay to do and what the board last confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRuntimeState {
    pub endpoint: RelayEndpoint,
    pub last_commanded_on: bool,
    pub last_ack_on: Option<bool>,
    pub last_ack_time: Option<DateTime<Utc>>,
    pub connected: bool,
    /// Error of the last wire attempt; cleared by the next success.
    pub last_error: Option<String>,
}

impl RelayRuntimeState {
    fn new(endpoint: RelayEndpoint) -> Self {
        Self {
            endpoint,
            last_commanded_on: false,
            last_ack_on: None,
            last_ack_time: None,
            connected: false,
            last_error: None,
        }
    }

    /// The board has not confirmed the state we last commanded.
    pub fn drift(&self) -> bool {
        self.last_ack_on != Some(self.last_commanded_on)
    }
}

/// Maps circuits to relays and keeps the runtime state of each one.
///
/// Cheap to clone. Every circuit has its own lock, so commands for one
/// circuit are applied in issue order while different circuits (and
/// different boards) proceed independently.
#[derive(Clone)]
pub struct RelayController {
    inner: Arc<Inner>,
}

struct Inner {
    links: HashMap<String, SerialLink>,
    relays: BTreeMap<String, Arc<Mutex<RelayRuntimeState>>>,
    events: EventBus,
}

impl RelayController {
    /// Every endpoint must reference one of `links` and circuits must be unique.
    pub fn new(
        links: Vec<SerialLink>,
        endpoints: Vec<RelayEndpoint>,
        events: EventBus,
    ) -> Result<Self> {
        let links: HashMap<String, SerialLink> = links
            .into_iter()
            .map(|link| (link.board_id().to_owned(), link))
            .collect();

        let mut relays = BTreeMap::new();
        for endpoint in endpoints {
            if !links.contains_key(&endpoint.board_id) {
                bail!(
                    "circuit {:?} references unknown board {:?}",
                    endpoint.circuit_id,
                    endpoint.board_id
                );
            }
            let circuit_id = endpoint.circuit_id.clone();
            let state = Arc::new(Mutex::new(RelayRuntimeState::new(endpoint)));
            if relays.insert(circuit_id.clone(), state).is_some() {
                bail!("circuit {circuit_id:?} is mapped to more than one relay");
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                links,
                relays,
                events,
            }),
        })
    }

    pub fn circuit_ids(&self) -> impl Iterator<Item = &str> {
        self.inner.relays.keys().map(String::as_str)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn link_state(&self, board_id: &str) -> Option<LinkState> {
        self.inner.links.get(board_id).map(SerialLink::state)
    }

    /// Switches `circuit_id` on or off.
    ///
    /// Succeeds without touching the wire when the board already confirmed
    /// `desired_on`. The intent is recorded even when the board cannot be
    /// reached, so a later call can retry it.
    pub async fn set_relay(&self, circuit_id: &str, desired_on: bool) -> Result<(), RelayError> {
        let entry = self
            .inner
            .relays
            .get(circuit_id)
            .ok_or_else(|| RelayError::UnknownCircuit(circuit_id.to_owned()))?;
        let mut state = entry.lock().await;
        state.last_commanded_on = desired_on;

        if state.connected && state.last_ack_on == Some(desired_on) {
            debug!(circuit_id = %circuit_id, on = desired_on, "Relay already in desired state");
            return Ok(());
        }

        let endpoint = state.endpoint.clone();
        let link = self
            .inner
            .links
            .get(&endpoint.board_id)
            .ok_or_else(|| RelayError::Unreachable(circuit_id.to_owned()))?;

        let response = link
            .command(RelayFrame::new(endpoint.channel, desired_on))
            .await;

        let acked_on = response.as_ref().ok().map(|ack| ack.on);
        let outcome = match response {
            Ok(ack) => {
                state.last_ack_on = Some(ack.on);
                state.last_ack_time = Some(Utc::now());
                state.connected = true;
                if ack.on == desired_on {
                    info!(circuit_id = %circuit_id, on = ack.on, "Relay switched");
                    Ok(())
                } else {
                    Err(RelayError::Mismatch {
                        circuit_id: circuit_id.to_owned(),
                        desired_on,
                        acked_on: ack.on,
                    })
                }
            }
            Err(e) if e.is_unreachable() => {
                state.connected = false;
                state.last_ack_on = None;
                Err(RelayError::Unreachable(circuit_id.to_owned()))
            }
            Err(e) => Err(RelayError::Link(e)),
        };

        // A failure identical to the previous one is not news.
        let error = outcome.as_ref().err().map(ToString::to_string);
        let repeated = error.is_some() && error == state.last_error;
        state.last_error = error.clone();
        drop(state);

        if repeated {
            debug!(circuit_id = %circuit_id, on = desired_on, "Relay still failing; event not published");
            return outcome;
        }

        self.inner.events.publish(RelayEvent {
            id: Uuid::new_v4(),
            circuit_id: circuit_id.to_owned(),
            board_id: endpoint.board_id,
            channel: endpoint.channel,
            desired_on,
            acked_on,
            success: outcome.is_ok(),
            error,
            recorded_at: Utc::now(),
        });

        outcome
    }

    pub async fn get_known_state(&self, circuit_id: &str) -> Option<RelayRuntimeState> {
        let entry = self.inner.relays.get(circuit_id)?;
        Some(entry.lock().await.clone())
    }

    /// `false` for unknown circuits.
    pub async fn get_drift(&self, circuit_id: &str) -> bool {
        match self.inner.relays.get(circuit_id) {
            Some(entry) => entry.lock().await.drift(),
            None => false,
        }
    }

    /// Runtime state of every circuit, ordered by circuit id.
    pub async fn snapshot(&self) -> Vec<RelayRuntimeState> {
        let mut states = Vec::with_capacity(self.inner.relays.len());
        for entry in self.inner.relays.values() {
            states.push(entry.lock().await.clone());
        }
        states
    }

    /// Refreshes `connected` from the links. Acks from a board whose link is
    /// not up are forgotten: the board may have reset, so its relays have to
    /// be confirmed again once it is back.
    pub async fn sync_link_states(&self) {
        for entry in self.inner.relays.values() {
            let mut state = entry.lock().await;
            let up = self.link_state(&state.endpoint.board_id) == Some(LinkState::Connected);
            if !up && state.last_ack_on.is_some() {
                debug!(circuit_id = %state.endpoint.circuit_id, "Link down; forgetting acknowledged state");
                state.last_ack_on = None;
            }
            state.connected = up;
        }
    }

    /// Best-effort switch-off of every circuit.
    pub async fn all_off(&self) {
        for circuit_id in self.circuit_ids() {
            if let Err(e) = self.set_relay(circuit_id, false).await {
                warn!(circuit_id = %circuit_id, error = %e, "Failed to switch circuit off");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::{
        error::LinkError,
        serial::{
            frame::{ETX, STX},
            transport::fake::{FakeBoard, FakeConnector},
        },
    };

    pub(crate) fn endpoint(circuit_id: &str, board_id: &str, channel: u8) -> RelayEndpoint {
        RelayEndpoint {
            circuit_id: circuit_id.to_owned(),
            board_id: board_id.to_owned(),
            channel,
        }
    }

    /// One fake board per `(board_id, path)`; resolves once every link is up.
    pub(crate) async fn rig(
        boards: &[(&str, &FakeBoard)],
        endpoints: Vec<RelayEndpoint>,
    ) -> RelayController {
        rig_with_keepalive(boards, endpoints, Duration::from_secs(3600)).await
    }

    pub(crate) async fn rig_with_keepalive(
        boards: &[(&str, &FakeBoard)],
        endpoints: Vec<RelayEndpoint>,
        keepalive: Duration,
    ) -> RelayController {
        let connector = boards
            .iter()
            .fold(FakeConnector::new(), |c, (id, board)| {
                c.with_board(&format!("/dev/fake{id}"), (*board).clone())
            });
        let connector = Arc::new(connector);
        let links: Vec<SerialLink> = boards
            .iter()
            .map(|(id, _)| {
                SerialLink::spawn(
                    *id,
                    format!("/dev/fake{id}"),
                    connector.clone(),
                    Duration::from_millis(20),
                    keepalive,
                )
            })
            .collect();
        for link in &links {
            wait_connected(link).await;
        }
        RelayController::new(links, endpoints, EventBus::default()).unwrap()
    }

    pub(crate) async fn wait_connected(link: &SerialLink) {
        let mut rx = link.subscribe();
        time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .expect("link never connected")
        .expect("link worker stopped");
    }

    pub(crate) async fn wait_board(controller: &RelayController, board_id: &str) {
        let link = controller.inner.links.get(board_id).unwrap();
        wait_connected(link).await;
    }

    #[tokio::test]
    async fn set_relay_records_ack() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 3)]).await;

        relays.set_relay("boiler", true).await.unwrap();

        let state = relays.get_known_state("boiler").await.unwrap();
        assert!(state.last_commanded_on);
        assert_eq!(state.last_ack_on, Some(true));
        assert!(state.last_ack_time.is_some());
        assert!(state.connected);
        assert!(!relays.get_drift("boiler").await);
        assert_eq!(board.frames(), vec![[STX, 3, 1, 4, ETX]]);
    }

    #[tokio::test]
    async fn repeated_set_relay_sends_one_frame() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 1)]).await;

        relays.set_relay("boiler", true).await.unwrap();
        relays.set_relay("boiler", true).await.unwrap();

        assert_eq!(board.frames().len(), 1);
    }

    #[tokio::test]
    async fn unknown_circuit_is_rejected() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 1)]).await;

        let err = relays.set_relay("sauna", true).await.unwrap_err();
        assert_eq!(err, RelayError::UnknownCircuit("sauna".into()));
        assert!(!relays.get_drift("sauna").await);
        assert!(relays.get_known_state("sauna").await.is_none());
    }

    #[tokio::test]
    async fn unreachable_board_keeps_intent() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 1)]).await;
        relays.set_relay("boiler", false).await.unwrap();

        board.unplug();
        let err = relays.set_relay("boiler", true).await.unwrap_err();
        assert_eq!(err, RelayError::Unreachable("boiler".into()));

        let state = relays.get_known_state("boiler").await.unwrap();
        assert!(state.last_commanded_on);
        assert_eq!(state.last_ack_on, None);
        assert!(!state.connected);
        assert!(relays.get_drift("boiler").await);

        // Fails fast while the link is down.
        let err = relays.set_relay("boiler", true).await.unwrap_err();
        assert_eq!(err, RelayError::Unreachable("boiler".into()));
    }

    #[tokio::test]
    async fn malformed_ack_leaves_drift() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 2)]).await;

        board.script_ack([STX, 2, 1, 0x42, ETX]);
        let err = relays.set_relay("boiler", true).await.unwrap_err();
        assert!(matches!(err, RelayError::Link(LinkError::Parse(_))), "{err}");

        let state = relays.get_known_state("boiler").await.unwrap();
        assert_eq!(state.last_ack_on, None);
        assert!(relays.get_drift("boiler").await);
    }

    #[tokio::test]
    async fn ack_with_other_state_is_a_mismatch() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 2)]).await;

        board.script_ack(RelayFrame::new(2, false).encode());
        let err = relays.set_relay("boiler", true).await.unwrap_err();
        assert!(matches!(err, RelayError::Mismatch { acked_on: false, .. }));

        let state = relays.get_known_state("boiler").await.unwrap();
        assert_eq!(state.last_ack_on, Some(false));
        assert!(relays.get_drift("boiler").await);
    }

    #[tokio::test]
    async fn sync_forgets_acks_of_disconnected_boards_only() {
        let one = FakeBoard::new();
        let two = FakeBoard::new();
        let relays = rig(
            &[("1", &one), ("2", &two)],
            vec![endpoint("boiler", "1", 1), endpoint("car", "2", 1)],
        )
        .await;
        relays.set_relay("boiler", true).await.unwrap();
        relays.set_relay("car", true).await.unwrap();

        one.unplug();
        // Keepalive is far off; force the next I/O now.
        let _ = relays.inner.links["1"].command(RelayFrame::new(9, false)).await;
        relays.sync_link_states().await;

        assert!(relays.get_drift("boiler").await);
        assert!(!relays.get_drift("car").await);
        assert!(relays.get_known_state("car").await.unwrap().connected);
    }

    #[tokio::test]
    async fn every_attempt_is_published() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 5)]).await;
        let mut events = relays.events().subscribe();

        relays.set_relay("boiler", true).await.unwrap();
        board.unplug();
        let _ = relays.set_relay("boiler", false).await;

        let ok = events.recv().await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.acked_on, Some(true));
        assert_eq!(ok.channel, 5);

        let failed = events.recv().await.unwrap();
        assert!(!failed.success);
        assert!(!failed.desired_on);
        assert_eq!(failed.acked_on, None);
        assert!(failed.error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn repeated_failures_publish_once_until_recovery() {
        let board = FakeBoard::new();
        let relays = rig(&[("1", &board)], vec![endpoint("boiler", "1", 1)]).await;
        let mut events = relays.events().subscribe();

        board.unplug();
        for _ in 0..3 {
            let err = relays.set_relay("boiler", true).await.unwrap_err();
            assert_eq!(err, RelayError::Unreachable("boiler".into()));
        }
        let state = relays.get_known_state("boiler").await.unwrap();
        assert!(state.last_error.unwrap().contains("unreachable"));

        board.plug_in();
        wait_board(&relays, "1").await;
        relays.sync_link_states().await;
        relays.set_relay("boiler", true).await.unwrap();

        let failed = events.recv().await.unwrap();
        assert!(!failed.success);
        let recovered = events.recv().await.unwrap();
        assert!(recovered.success);
        assert!(events.try_recv().is_err());
        assert_eq!(relays.get_known_state("boiler").await.unwrap().last_error, None);
    }

    #[tokio::test]
    async fn idle_board_unplug_is_noticed() {
        let board = FakeBoard::new();
        let relays = rig_with_keepalive(
            &[("1", &board)],
            vec![endpoint("boiler", "1", 1)],
            Duration::from_millis(30),
        )
        .await;
        relays.set_relay("boiler", true).await.unwrap();

        // Nothing is commanded while the board disappears.
        board.unplug();
        let mut rx = relays.inner.links["1"].subscribe();
        time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s != LinkState::Connected),
        )
        .await
        .expect("link still connected")
        .expect("link worker stopped");
        relays.sync_link_states().await;

        assert_ne!(relays.link_state("1"), Some(LinkState::Connected));
        let state = relays.get_known_state("boiler").await.unwrap();
        assert!(!state.connected);
        assert!(relays.get_drift("boiler").await);
    }

    #[tokio::test]
    async fn rejects_endpoint_on_unknown_board() {
        let err = RelayController::new(vec![], vec![endpoint("boiler", "9", 1)], EventBus::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown board"));
    }
}
