use chrono::{NaiveTime, Timelike};
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{CatalogHold, Engine, EngineError, Entity};

/// Windows `seed_default_slots` ensures exist: `(start_hour, end_hour, price override)`.
pub const DEFAULT_WINDOWS: [(u32, u32, Option<u32>); 5] = [
    (8, 10, None),
    (10, 12, None),
    (12, 14, Some(25_000)),
    (14, 16, None),
    (16, 18, None),
];

impl Engine {
    pub async fn define_slot(
        &self,
        start_of_day: NaiveTime,
        end_of_day: NaiveTime,
        price_cents: u32,
    ) -> Result<SlotDefinition, EngineError> {
        let hold = self.catalog_hold().await;
        self.define_slot_locked(&hold, start_of_day, end_of_day, price_cents)
            .await
    }

    async fn define_slot_locked(
        &self,
        hold: &CatalogHold,
        start_of_day: NaiveTime,
        end_of_day: NaiveTime,
        price_cents: u32,
    ) -> Result<SlotDefinition, EngineError> {
        if start_of_day >= end_of_day {
            return Err(EngineError::InvalidInterval {
                start: i64::from(start_of_day.num_seconds_from_midnight()) * 1000,
                end: i64::from(end_of_day.num_seconds_from_midnight()) * 1000,
            });
        }
        let slot = SlotDefinition {
            id: Ulid::new(),
            start_of_day,
            end_of_day,
            price_cents,
            active: true,
        };
        let tables = self.tables();
        self.persist_and_apply(
            Event::SlotDefined { slot: slot.clone() },
            hold.clone(),
            move |e, _| tables.apply_catalog(e),
        )
        .await?;
        info!("defined slot {} ({}) at {}", slot.id, slot.label(), format_price(price_cents));
        Ok(slot)
    }

    /// Soft-enable or disable a slot. Existing bookings are unaffected.
    pub async fn set_slot_active(&self, id: Ulid, active: bool) -> Result<SlotDefinition, EngineError> {
        let hold = self.catalog_hold().await;
        let current = self.get_slot(id)?;
        if current.active == active {
            return Ok(current);
        }
        let tables = self.tables();
        self.persist_and_apply(
            Event::SlotActivationChanged { id, active },
            hold,
            move |e, _| tables.apply_catalog(e),
        )
        .await?;
        info!("slot {id} active={active}");
        self.get_slot(id)
    }

    /// Create any default window not already present. Returns the new slots.
    pub async fn seed_default_slots(&self) -> Result<Vec<SlotDefinition>, EngineError> {
        let hold = self.catalog_hold().await;
        let default_price = self.config().default_slot_price_cents;
        let mut created = Vec::new();
        for (start_h, end_h, price) in DEFAULT_WINDOWS {
            let (Some(start), Some(end)) = (
                NaiveTime::from_hms_opt(start_h, 0, 0),
                NaiveTime::from_hms_opt(end_h, 0, 0),
            ) else {
                continue;
            };
            let exists = self
                .slots
                .iter()
                .any(|s| s.start_of_day == start && s.end_of_day == end);
            if !exists {
                let slot = self
                    .define_slot_locked(&hold, start, end, price.unwrap_or(default_price))
                    .await?;
                created.push(slot);
            }
        }
        Ok(created)
    }

    /// Any slot, active or not. Historical bookings still resolve their slot.
    pub fn get_slot(&self, id: Ulid) -> Result<SlotDefinition, EngineError> {
        self.slots
            .get(&id)
            .map(|s| s.clone())
            .ok_or(EngineError::NotFound(Entity::Slot(id)))
    }

    /// A slot that new bookings may use: `NotFound` when absent or inactive.
    pub fn bookable_slot(&self, id: Ulid) -> Result<SlotDefinition, EngineError> {
        match self.get_slot(id) {
            Ok(slot) if slot.active => Ok(slot),
            _ => Err(EngineError::NotFound(Entity::Slot(id))),
        }
    }

    /// Every slot ordered by start of day.
    pub fn list_slots(&self) -> Vec<SlotDefinition> {
        let mut slots: Vec<SlotDefinition> = self.slots.iter().map(|s| s.clone()).collect();
        slots.sort_by_key(|s| (s.start_of_day, s.end_of_day, s.id));
        slots
    }

    pub fn list_active_slots(&self) -> Vec<SlotDefinition> {
        let mut slots = self.list_slots();
        slots.retain(|s| s.active);
        slots
    }
}
