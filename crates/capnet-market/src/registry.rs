//! Provider registry.
//!
//! The registry is the sole source of truth for matching decisions. Every
//! call is applied atomically and is visible to the next read; there is no
//! caching layer in front of it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::MarketError;
use crate::record::{ProviderId, ProviderRecord};

/// Keyed store of provider records.
pub trait ProviderRegistry: Send + Sync {
    /// Inserts or fully replaces the record keyed by `record.id`.
    fn upsert(&self, record: ProviderRecord) -> Result<(), MarketError>;

    /// Fetches one record.
    fn get(&self, id: &ProviderId) -> Result<Option<ProviderRecord>, MarketError>;

    /// Providers that can take `required_units` by `needed_by` and are not held
    /// at `now`, cheapest first. Equal prices keep provider id order.
    fn query_eligible(
        &self,
        required_units: u64,
        needed_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProviderRecord>, MarketError>;

    /// Applies `f` to the record as one atomic step.
    ///
    /// If `f` fails the stored record is left untouched. Returns the record as
    /// written.
    fn modify(
        &self,
        id: &ProviderId,
        f: &mut dyn FnMut(&mut ProviderRecord) -> Result<(), MarketError>,
    ) -> Result<ProviderRecord, MarketError>;

    /// All records in provider id order.
    fn snapshot(&self) -> Result<Vec<ProviderRecord>, MarketError>;

    /// Sets `held_until`.
    fn set_held(&self, id: &ProviderId, until: DateTime<Utc>) -> Result<ProviderRecord, MarketError> {
        self.modify(id, &mut |record| {
            record.held_until = until;
            Ok(())
        })
    }

    /// Sets `available_from`.
    fn set_available_from(
        &self,
        id: &ProviderId,
        ts: DateTime<Utc>,
    ) -> Result<ProviderRecord, MarketError> {
        self.modify(id, &mut |record| {
            record.available_from = ts;
            Ok(())
        })
    }
}

/// Registry held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    records: RwLock<BTreeMap<ProviderId, ProviderRecord>>,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = ProviderRecord>) -> Self {
        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            records: RwLock::new(records),
        }
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no provider has registered.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ProviderRegistry for InMemoryRegistry {
    fn upsert(&self, record: ProviderRecord) -> Result<(), MarketError> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &ProviderId) -> Result<Option<ProviderRecord>, MarketError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn query_eligible(
        &self,
        required_units: u64,
        needed_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProviderRecord>, MarketError> {
        let mut eligible: Vec<ProviderRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.is_eligible(required_units, needed_by, now))
            .cloned()
            .collect();

        // Stable sort keeps id order among equal prices
        eligible.sort_by(|a, b| a.price_per_unit.total_cmp(&b.price_per_unit));

        Ok(eligible)
    }

    fn modify(
        &self,
        id: &ProviderId,
        f: &mut dyn FnMut(&mut ProviderRecord) -> Result<(), MarketError>,
    ) -> Result<ProviderRecord, MarketError> {
        let mut records = self.records.write();
        let stored = records
            .get_mut(id)
            .ok_or_else(|| MarketError::ProviderNotFound(id.clone()))?;

        let mut updated = stored.clone();
        f(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    fn snapshot(&self) -> Result<Vec<ProviderRecord>, MarketError> {
        Ok(self.records.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(id: &str, capacity: u64, price: f64) -> ProviderRecord {
        ProviderRecord::new(id.into(), capacity, price, t0(), t0())
    }

    #[test]
    fn upsert_replaces_existing_record() {
        let registry = InMemoryRegistry::new();
        registry.upsert(record("p1", 45, 1.0)).unwrap();
        registry.upsert(record("p1", 90, 2.0)).unwrap();

        assert_eq!(registry.len(), 1);
        let stored = registry.get(&"p1".into()).unwrap().unwrap();
        assert_eq!(stored.capacity, 90);
        assert!((stored.price_per_unit - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn query_orders_by_price_then_id() {
        let registry = InMemoryRegistry::with_records([
            record("p3", 50, 2.0),
            record("p2", 50, 1.0),
            record("p1", 50, 1.0),
        ]);

        let ids: Vec<String> = registry
            .query_eligible(10, t0(), t0())
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, ["p1", "p2", "p3"]);
    }

    #[test]
    fn query_filters_capacity_availability_and_holds() {
        let mut late = record("late", 50, 1.0);
        late.available_from = t0() + TimeDelta::seconds(60);
        let mut held = record("held", 50, 1.0);
        held.held_until = t0() + TimeDelta::seconds(10);

        let registry = InMemoryRegistry::with_records([
            record("small", 5, 0.5),
            late,
            held,
            record("ok", 50, 3.0),
        ]);

        let eligible = registry
            .query_eligible(10, t0() + TimeDelta::seconds(5), t0())
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id.as_str(), "ok");
    }

    #[test]
    fn modify_is_all_or_nothing() {
        let registry = InMemoryRegistry::with_records([record("p1", 45, 1.0)]);
        let result = registry.modify(&"p1".into(), &mut |r| {
            r.capacity = 0;
            Err(MarketError::InvalidRequest("nope".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(registry.get(&"p1".into()).unwrap().unwrap().capacity, 45);
    }

    #[test]
    fn modify_unknown_provider_fails() {
        let registry = InMemoryRegistry::new();
        let err = registry.set_held(&"ghost".into(), t0()).unwrap_err();
        assert_eq!(err, MarketError::ProviderNotFound("ghost".into()));
    }

    #[test]
    fn single_field_setters_leave_other_fields_alone() {
        let registry = InMemoryRegistry::with_records([record("p1", 45, 1.0)]);
        let until = t0() + TimeDelta::seconds(10);
        let held = registry.set_held(&"p1".into(), until).unwrap();
        assert_eq!(held.held_until, until);
        assert_eq!(held.available_from, t0());

        let moved = registry.set_available_from(&"p1".into(), until).unwrap();
        assert_eq!(moved.available_from, until);
        assert_eq!(moved.held_until, until);
    }

    proptest! {
        #[test]
        fn query_never_returns_ineligible_providers(
            specs in proptest::collection::vec((1u64..200, 1u32..50, -30i64..30, -30i64..30), 0..20),
            units in 1u64..200,
            deadline_offset in -30i64..30,
        ) {
            let now = t0();
            let needed_by = now + TimeDelta::seconds(deadline_offset);
            let registry = InMemoryRegistry::with_records(specs.iter().enumerate().map(
                |(i, (capacity, price, avail, held))| ProviderRecord {
                    id: format!("p{i:02}").into(),
                    capacity: *capacity,
                    price_per_unit: f64::from(*price),
                    available_from: now + TimeDelta::seconds(*avail),
                    held_until: now + TimeDelta::seconds(*held),
                },
            ));

            let eligible = registry.query_eligible(units, needed_by, now).unwrap();
            for r in &eligible {
                prop_assert!(r.capacity >= units);
                prop_assert!(r.available_from <= needed_by);
                prop_assert!(r.held_until <= now);
            }
            for pair in eligible.windows(2) {
                prop_assert!(pair[0].price_per_unit <= pair[1].price_per_unit);
            }
        }
    }
}
