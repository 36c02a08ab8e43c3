/*!
Doubles du cloud pour tests sans API réelle

- RecordingSink : enregistre chaque lot de télémétrie publié
- StaticFeed : rend les commandes mises en file, une seule fois, et peut
  simuler un cloud injoignable
*/

use farm_gateway::cloud::{CloudError, CommandFeed, TelemetrySink};
use farm_protocol::{CommandEnvelope, SystemCode, TelemetryBatch};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<TelemetryBatch>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Dernière valeur publiée pour `code`/`name`, tous lots confondus.
    pub fn last_value(&self, code: &str, name: &str) -> Option<u32> {
        let code = SystemCode::new(code);
        self.batches
            .lock()
            .iter()
            .rev()
            .find_map(|batch| batch.get(&code, name).map(|point| point.value))
    }
}

impl TelemetrySink for RecordingSink {
    fn publish(&self, batch: TelemetryBatch) -> BoxFuture<'_, Result<(), CloudError>> {
        self.batches.lock().push(batch);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
struct FeedState {
    pending: Vec<CommandEnvelope>,
    unreachable: bool,
    polls: Vec<i64>,
}

#[derive(Clone, Default)]
pub struct StaticFeed {
    state: Arc<Mutex<FeedState>>,
}

impl StaticFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, code: &str, action: &str, data: i64) {
        self.state.lock().pending.push(CommandEnvelope {
            system_code: SystemCode::new(code),
            action: action.to_string(),
            data,
        });
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// `since` de chaque interrogation reçue.
    pub fn polls(&self) -> Vec<i64> {
        self.state.lock().polls.clone()
    }
}

impl CommandFeed for StaticFeed {
    fn fetch_commands(&self, since: i64) -> BoxFuture<'_, Result<Vec<CommandEnvelope>, CloudError>> {
        let mut state = self.state.lock();
        state.polls.push(since);
        let res = if state.unreachable {
            Err(CloudError::Unreachable("simulated outage".into()))
        } else {
            Ok(std::mem::take(&mut state.pending))
        };
        Box::pin(async move { res })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_hands_out_commands_once() {
        let feed = StaticFeed::new();
        feed.push("Z1", "led_color", 4);
        assert_eq!(feed.fetch_commands(0).await.unwrap().len(), 1);
        assert!(feed.fetch_commands(1).await.unwrap().is_empty());

        feed.set_unreachable(true);
        assert!(feed.fetch_commands(2).await.is_err());
        assert_eq!(feed.polls(), vec![0, 1, 2]);
    }
}
