//! Danger-zone cache and zone mutations
//!
//! Active zones are cached per [`ZoneScope`] with a TTL. Every create, update
//! or delete goes through [`ZoneStore`] so the affected scopes are dropped
//! before the next lookup.

use crate::error::{TrackerError, TrackerResult};

use dashmap::DashMap;
use flight_core::{
    CoreError, DangerZone, DangerZoneUpdate, NewDangerZone, OperatorId, ZoneId, ZoneScope,
};
use flight_db::FlightStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Clone)]
struct CachedZones {
    zones: Arc<Vec<DangerZone>>,
    loaded_at: Instant,
}

pub struct ZoneStore {
    store: Arc<dyn FlightStore>,
    cache: DashMap<ZoneScope, CachedZones>,
    ttl: Duration,
}

impl ZoneStore {
    pub fn new(store: Arc<dyn FlightStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Active zones for `scope`, from cache when fresh
    pub async fn active_zones(&self, scope: &ZoneScope) -> TrackerResult<Arc<Vec<DangerZone>>> {
        if let Some(entry) = self.cache.get(scope) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Ok(entry.zones.clone());
            }
        }

        let zones = Arc::new(self.store.active_zones(scope).await?);
        debug!(scope = %scope, count = zones.len(), "Loaded danger zones");
        self.cache.insert(
            scope.clone(),
            CachedZones {
                zones: zones.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(zones)
    }

    /// Zones that contain the position for this operator's flights
    pub async fn containing(
        &self,
        operator_id: &OperatorId,
        latitude: f64,
        longitude: f64,
        altitude_meters: f64,
    ) -> TrackerResult<Vec<DangerZone>> {
        let zones = self
            .active_zones(&ZoneScope::Operator(operator_id.clone()))
            .await?;

        Ok(zones
            .iter()
            .filter(|zone| zone.applies_to(latitude, longitude, altitude_meters))
            .cloned()
            .collect())
    }

    /// Drop cached scopes affected by a change to a zone owned by `owner_id`.
    ///
    /// Operator scopes embed the public zones, so a change touching a public
    /// zone clears every scope.
    pub fn invalidate(&self, owner_id: Option<&OperatorId>, touches_public: bool) {
        if touches_public || owner_id.is_none() {
            self.cache.clear();
        } else if let Some(owner) = owner_id {
            self.cache.remove(&ZoneScope::Operator(owner.clone()));
            self.cache.remove(&ZoneScope::Public);
        }
    }

    /// Remove expired entries, returning how many were dropped
    pub fn prune(&self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.loaded_at.elapsed() < self.ttl);
        let pruned = before.saturating_sub(self.cache.len());
        if pruned > 0 {
            info!(pruned, "Pruned expired zone cache entries");
        }
        pruned
    }

    pub fn cached_scopes(&self) -> usize {
        self.cache.len()
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Active zones the operator can see, oldest first. Bypasses the cache.
    pub async fn list_visible(&self, operator_id: &OperatorId) -> TrackerResult<Vec<DangerZone>> {
        let mut zones = self
            .store
            .active_zones(&ZoneScope::Operator(operator_id.clone()))
            .await?;
        zones.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(zones)
    }

    pub async fn create(
        &self,
        owner_id: &OperatorId,
        request: NewDangerZone,
    ) -> TrackerResult<DangerZone> {
        let zone = DangerZone::from_request(Some(owner_id.clone()), request)?;
        self.store.insert_zone(&zone).await?;
        self.invalidate(Some(owner_id), zone.is_public());

        info!(zone_id = %zone.id, owner = %owner_id, name = %zone.name, "Danger zone created");
        Ok(zone)
    }

    pub async fn update(
        &self,
        caller: &OperatorId,
        id: &ZoneId,
        update: DangerZoneUpdate,
    ) -> TrackerResult<DangerZone> {
        let mut zone = self.owned_zone(caller, id).await?;
        let was_public = zone.is_public();

        zone.apply(update)?;
        self.store.update_zone(&zone).await?;
        self.invalidate(zone.owner_id.as_ref(), was_public || zone.is_public());

        info!(zone_id = %zone.id, "Danger zone updated");
        Ok(zone)
    }

    pub async fn delete(&self, caller: &OperatorId, id: &ZoneId) -> TrackerResult<()> {
        let zone = self.owned_zone(caller, id).await?;

        if !self.store.delete_zone(id).await? {
            return Err(CoreError::zone_not_found(id).into());
        }
        self.invalidate(zone.owner_id.as_ref(), zone.is_public());

        info!(zone_id = %id, "Danger zone deleted");
        Ok(())
    }

    async fn owned_zone(&self, caller: &OperatorId, id: &ZoneId) -> TrackerResult<DangerZone> {
        let zone = self
            .store
            .get_zone(id)
            .await?
            .ok_or_else(|| CoreError::zone_not_found(id))?;

        if zone.owner_id.as_ref() != Some(caller) {
            return Err(TrackerError::forbidden(format!("danger zone {id}")));
        }
        Ok(zone)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use flight_core::{Coordinate, ZoneType};
    use flight_db::MemoryStore;

    fn square(is_public: bool) -> NewDangerZone {
        NewDangerZone {
            name: "Stadium".into(),
            description: None,
            zone_type: ZoneType::Restricted,
            coordinates: vec![
                Coordinate::new(0.0, 0.0),
                Coordinate::new(0.0, 1.0),
                Coordinate::new(1.0, 1.0),
                Coordinate::new(1.0, 0.0),
            ],
            altitude_limit_meters: Some(100.0),
            is_public,
        }
    }

    fn zone_store(ttl: Duration) -> (Arc<MemoryStore>, ZoneStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ZoneStore::new(store, ttl))
    }

    #[tokio::test]
    async fn test_containing_respects_altitude_limit() {
        let (_, zones) = zone_store(Duration::from_secs(300));
        let owner = OperatorId::new("op-1");
        zones.create(&owner, square(false)).await.unwrap();

        assert_eq!(zones.containing(&owner, 0.5, 0.5, 50.0).await.unwrap().len(), 1);
        assert!(zones.containing(&owner, 0.5, 0.5, 150.0).await.unwrap().is_empty());
        assert!(zones.containing(&owner, 2.0, 2.0, 50.0).await.unwrap().is_empty());

        // Private zones do not apply to other operators
        let other = OperatorId::new("op-2");
        assert!(zones.containing(&other, 0.5, 0.5, 50.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cache() {
        let (_, zones) = zone_store(Duration::from_secs(300));
        let owner = OperatorId::new("op-1");
        let zone = zones.create(&owner, square(false)).await.unwrap();

        assert_eq!(zones.containing(&owner, 0.5, 0.5, 50.0).await.unwrap().len(), 1);
        assert_eq!(zones.cached_scopes(), 1);

        zones
            .update(
                &owner,
                &zone.id,
                DangerZoneUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(zones.cached_scopes(), 0);
        assert!(zones.containing(&owner, 0.5, 0.5, 50.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_public_zone_change_reaches_other_operators() {
        let (_, zones) = zone_store(Duration::from_secs(300));
        let owner = OperatorId::new("op-1");
        let observer = OperatorId::new("op-2");

        // Warm the observer's scope before the zone exists
        assert!(zones.containing(&observer, 0.5, 0.5, 10.0).await.unwrap().is_empty());

        zones.create(&owner, square(true)).await.unwrap();
        assert_eq!(zones.containing(&observer, 0.5, 0.5, 10.0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_owner_mutates() {
        let (_, zones) = zone_store(Duration::from_secs(300));
        let owner = OperatorId::new("op-1");
        let zone = zones.create(&owner, square(true)).await.unwrap();

        let err = zones.delete(&OperatorId::new("op-2"), &zone.id).await.unwrap_err();
        assert!(matches!(err, TrackerError::Forbidden(_)));

        zones.delete(&owner, &zone.id).await.unwrap();
        let err = zones.delete(&owner, &zone.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_prune_drops_expired_scopes() {
        let (_, zones) = zone_store(Duration::from_millis(0));
        zones.active_zones(&ZoneScope::Public).await.unwrap();
        assert_eq!(zones.cached_scopes(), 1);
        assert_eq!(zones.prune(), 1);
        assert_eq!(zones.cached_scopes(), 0);
    }
}
