//! Simulated tag values for the in-memory connections.
//!
//! Each configured tag ramps up and down between its bounds by `step`, one
//! change per `update_interval_ms`.

use crate::config::{ConnectionSettings, TagSettings};
use edge_dispatch::{CancellationToken, Connection, MemoryConnection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A triangle wave between `min` and `max`.
#[derive(Debug, Clone)]
pub struct TagRamp {
    key: String,
    min: f64,
    max: f64,
    step: f64,
    value: f64,
    rising: bool,
}

impl TagRamp {
    pub fn new(tag: &TagSettings) -> Self {
        Self {
            key: tag.key.clone(),
            min: tag.min,
            max: tag.max,
            step: tag.step,
            value: tag.min,
            rising: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Advances one step, turning around at either bound.
    pub fn advance(&mut self) -> f64 {
        if self.rising {
            self.value += self.step;
            if self.value >= self.max {
                self.value = self.max;
                self.rising = false;
            }
        } else {
            self.value -= self.step;
            if self.value <= self.min {
                self.value = self.min;
                self.rising = true;
            }
        }
        self.value
    }
}

/// Drives one connection's tags until `cancel` fires.
pub struct Simulator {
    connection: Arc<MemoryConnection>,
    ramps: Vec<TagRamp>,
    interval: Duration,
}

impl Simulator {
    /// Creates the simulator and seeds every tag with its lower bound, so
    /// reads succeed before the first change.
    pub fn new(connection: Arc<MemoryConnection>, settings: &ConnectionSettings) -> Self {
        let ramps: Vec<TagRamp> = settings.tags.iter().map(TagRamp::new).collect();
        for ramp in &ramps {
            connection.seed_value(ramp.key(), ramp.value());
        }

        Self {
            connection,
            ramps,
            interval: Duration::from_millis(settings.update_interval_ms),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "🔄 Simulating {} tag(s) on {} every {:?}",
            self.ramps.len(),
            self.connection.name(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for ramp in &mut self.ramps {
                        let value = ramp.advance();
                        self.connection.set_value(ramp.key(), value);
                    }
                }
            }
        }

        debug!("🧹 Simulation on {} stopped", self.connection.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_dispatch::RawValue;

    fn tag(min: f64, max: f64, step: f64) -> TagSettings {
        TagSettings {
            key: "line1/pressure".to_string(),
            min,
            max,
            step,
            alarm_above: None,
        }
    }

    #[test]
    fn test_ramp_turns_around_at_bounds() {
        let mut ramp = TagRamp::new(&tag(0.0, 2.0, 1.0));
        let values: Vec<f64> = (0..6).map(|_| ramp.advance()).collect();
        assert_eq!(values, [1.0, 2.0, 1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_ramp_clamps_overshoot() {
        let mut ramp = TagRamp::new(&tag(0.0, 1.0, 0.75));
        assert_eq!(ramp.advance(), 0.75);
        assert_eq!(ramp.advance(), 1.0);
        assert_eq!(ramp.advance(), 0.25);
        assert_eq!(ramp.advance(), 0.0);
    }

    #[tokio::test]
    async fn test_simulator_seeds_and_updates_values() {
        let connection = Arc::new(MemoryConnection::new("plc1", "plc"));
        let settings = ConnectionSettings {
            name: "plc1".to_string(),
            kind: "plc".to_string(),
            update_interval_ms: 10,
            tags: vec![tag(1.0, 4.0, 0.5)],
        };

        let simulator = Simulator::new(connection.clone(), &settings);
        assert_eq!(connection.value("line1/pressure"), Some(RawValue::Float(1.0)));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(simulator.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        let value = connection.value("line1/pressure").and_then(|v| v.as_f64()).unwrap();
        assert!(value > 1.0);
    }
}
