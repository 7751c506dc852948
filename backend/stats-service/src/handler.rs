//! Aggregation message handler
//!
//! Decodes a stat event from a delivery and applies it to the store. A payload
//! that does not decode fails every time it is retried; such a message blocks
//! its partition until it is removed from the topic.
//!
//! With a non-atomic store the player and team steps run separately. A
//! delivery whose player step succeeded is remembered until its team step
//! does, so a retry of the same offset only repeats the team step.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::kafka::group::{Delivery, HandlerError, MessageHandler};
use crate::models::StatEvent;
use crate::repository::StatsStore;

/// (topic, partition, offset)
type DeliveryId = (String, i32, i64);

pub struct AggregationHandler {
    store: Arc<dyn StatsStore>,
    player_applied: Mutex<HashSet<DeliveryId>>,
}

impl AggregationHandler {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self {
            store,
            player_applied: Mutex::new(HashSet::new()),
        }
    }

    async fn apply_in_steps(
        &self,
        delivery: &Delivery,
        event: &StatEvent,
    ) -> Result<(), HandlerError> {
        let id = (delivery.topic.clone(), delivery.partition, delivery.offset);

        if self.player_applied.lock().contains(&id) {
            debug!(
                partition = delivery.partition,
                offset = delivery.offset,
                "Player aggregate already applied, retrying team aggregate"
            );
        } else {
            self.store
                .apply_player(event)
                .await
                .map_err(|e| HandlerError::Store(e.to_string()))?;
            self.player_applied.lock().insert(id.clone());
        }

        if let Err(e) = self.store.apply_team(event).await {
            warn!(
                partition = delivery.partition,
                offset = delivery.offset,
                player = %event.player,
                team = %event.team,
                season = %event.season,
                error = %e,
                "Team aggregate update failed, player aggregate already applied"
            );
            return Err(HandlerError::Store(e.after_player_step().to_string()));
        }

        self.player_applied.lock().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for AggregationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let event: StatEvent = serde_json::from_slice(&delivery.payload).map_err(|e| {
            error!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "Failed to decode stat event"
            );
            HandlerError::Decode(e.to_string())
        })?;

        if self.store.atomic() {
            self.store
                .apply(&event)
                .await
                .map_err(|e| HandlerError::Store(e.to_string()))?;
        } else {
            self.apply_in_steps(delivery, &event).await?;
        }

        debug!(
            partition = delivery.partition,
            offset = delivery.offset,
            player = %event.player,
            team = %event.team,
            season = %event.season,
            "Aggregated stat event"
        );
        Ok(())
    }
}
