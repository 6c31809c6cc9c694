//! The round-promise state machine.

use tokio::sync::mpsc;
use tracing::trace;

/// Promise state for one acceptor instance.
///
/// `promised` only ever increases; the accepted round/value pair is written
/// by the nomination phase and only echoed here.
#[derive(Debug, Default)]
pub struct AcceptorState {
    promised: u64,
    accepted_round: u64,
    accepted_value: String,
}

impl AcceptorState {
    #[must_use]
    pub fn new() -> Self {
        AcceptorState::default()
    }

    /// Handle a round invitation.
    ///
    /// Grants a promise, and returns the reply to transmit, only when
    /// `round` strictly exceeds every previously granted round. A stale or
    /// duplicate invitation returns `None`.
    pub fn invite(&mut self, round: u64) -> Option<String> {
        if round <= self.promised {
            return None;
        }
        self.promised = round;
        Some(format!(
            "ACCEPT:{round}:{}:{}",
            self.accepted_round, self.accepted_value
        ))
    }
}

/// Run the acceptor loop.
///
/// Reads `sender:COMMAND:round` messages from `ins` and emits promise
/// replies on `outs`. A message that does not split into exactly three
/// colon-delimited fields, carries an unrecognized command, or proposes a
/// stale round is silently discarded; a timeout on the proposer side is the
/// only signal. The promise safety property holds under arbitrary input.
///
/// Replies are queued without blocking the inbound loop and transmitted in
/// order by a dedicated task, so a slow outbound channel never stalls the
/// processing of subsequent invitations. Once `ins` is exhausted, every
/// started reply is delivered before the last `outs` sender drops and the
/// channel closes.
///
/// `quorum` is consumed by the nomination/commit phase of a full consensus
/// node; the promise role accepts it to preserve the interface and does not
/// read it.
pub async fn run(quorum: usize, mut ins: mpsc::Receiver<String>, outs: mpsc::Sender<String>) {
    let _ = quorum;

    let (queue, mut pending) = mpsc::unbounded_channel::<String>();
    let forwarder = tokio::spawn(async move {
        while let Some(reply) = pending.recv().await {
            if outs.send(reply).await.is_err() {
                return;
            }
        }
    });

    let mut state = AcceptorState::new();
    while let Some(msg) = ins.recv().await {
        let mut fields = msg.split(':');
        let (Some(_sender), Some(cmd), Some(round), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            trace!(%msg, "discarding malformed message");
            continue;
        };

        if cmd != "INVITE" {
            trace!(%cmd, "discarding unrecognized command");
            continue;
        }

        // An unparseable round counts as round 0, which can never exceed
        // the promised round.
        let round = round.parse::<u64>().unwrap_or(0);
        match state.invite(round) {
            Some(reply) => {
                trace!(round, "promised");
                let _ = queue.send(reply);
            }
            None => trace!(round, "discarding stale invitation"),
        }
    }

    drop(queue);
    let _ = forwarder.await;
}
