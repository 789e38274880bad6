//! In-process candidate fan-out.
//!
//! Downstream consumers (consensus, outcome tracking) subscribe here. The
//! channel is a tokio broadcast: publication is one attempt, at-most-once;
//! a send with no live subscribers is an error the caller logs and tolerates.

use tokio::sync::broadcast;

use crate::events::CandidateEvent;

#[derive(Clone)]
pub struct CandidateBus {
    tx: broadcast::Sender<CandidateEvent>,
}

impl CandidateBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(
        &self,
        event: CandidateEvent,
    ) -> Result<usize, broadcast::error::SendError<CandidateEvent>> {
        self.tx.send(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CandidateEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CandidateMeta, LeaderboardMeta};

    fn sample_event(address: &str) -> CandidateEvent {
        CandidateEvent {
            address: address.to_string(),
            source: "daily".to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            tags: vec!["period:30".to_string(), "leaderboard".to_string()],
            nickname: None,
            score_hint: 0.8,
            meta: CandidateMeta {
                leaderboard: LeaderboardMeta {
                    period_days: 30,
                    rank: 1,
                    weight: 1.0,
                    score: 0.8,
                    win_rate: 0.6,
                    executed_orders: 50,
                    realized_pnl: 1000.0,
                    pnl_consistency: 0.5,
                    efficiency: 20.0,
                    labels: vec![],
                },
            },
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_all_subscribers() {
        let bus = CandidateBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = sample_event("0xabc");
        bus.publish(event.clone()).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_an_error() {
        let bus = CandidateBus::new(16);
        assert!(bus.publish(sample_event("0xabc")).is_err());
    }
}
