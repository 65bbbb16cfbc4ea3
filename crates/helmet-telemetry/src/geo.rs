//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Great-circle distance with a short-lived memo.
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::DistanceCacheConfig;

/// Equatorial radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Coordinate {
    /// Construct without validation.
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Construct only when both components are finite.
    pub fn checked(latitude: f64, longitude: f64) -> Option<Self> {
        (latitude.is_finite() && longitude.is_finite()).then_some(Self::new(latitude, longitude))
    }

    fn is_usable(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

impl std::str::FromStr for Coordinate {
    type Err = String;

    /// Parses `"lat,lon"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s
            .split_once(',')
            .ok_or_else(|| format!("expected \"lat,lon\", got {s:?}"))?;
        let latitude = lat
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid latitude {lat:?}: {err}"))?;
        let longitude = lon
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid longitude {lon:?}: {err}"))?;
        Coordinate::checked(latitude, longitude)
            .ok_or_else(|| format!("non-finite coordinate {s:?}"))
    }
}

/// Haversine distance in meters.
pub fn haversine_m(from: Coordinate, to: Coordinate) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

fn round_km(meters: f64) -> f64 {
    (meters / 1000.0 * 100.0).round() / 100.0
}

type CacheKey = [u64; 4];

fn cache_key(from: Coordinate, to: Coordinate) -> CacheKey {
    [
        from.latitude.to_bits(),
        from.longitude.to_bits(),
        to.latitude.to_bits(),
        to.longitude.to_bits(),
    ]
}

#[derive(Debug, Clone, Copy)]
struct CachedDistance {
    km: f64,
    computed_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: IndexMap<CacheKey, CachedDistance>,
    hits: u64,
    misses: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that computed a fresh distance.
    pub misses: u64,
}

/// Memoizes rounded kilometre distances per coordinate pair.
///
/// Entries live for `ttl`. When the cache grows past `capacity` the
/// oldest-inserted entry is evicted (FIFO, lookups do not refresh order).
#[derive(Debug)]
pub struct DistanceCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl DistanceCache {
    /// Default entry lifetime.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
    /// Default entry bound.
    pub const DEFAULT_CAPACITY: usize = 100;

    /// Create a cache with explicit bounds. A zero capacity is raised to one.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Create a cache from configuration.
    pub fn from_config(config: &DistanceCacheConfig) -> Self {
        Self::new(config.ttl, config.capacity)
    }

    /// Distance in kilometres rounded to two decimals, or `None` when either
    /// point is missing or non-finite.
    pub fn distance_km(&self, from: Option<Coordinate>, to: Option<Coordinate>) -> Option<f64> {
        self.distance_km_at(from, to, Instant::now())
    }

    /// As [`DistanceCache::distance_km`] with an explicit clock reading.
    pub fn distance_km_at(
        &self,
        from: Option<Coordinate>,
        to: Option<Coordinate>,
        now: Instant,
    ) -> Option<f64> {
        let (from, to) = (from?, to?);
        if !from.is_usable() || !to.is_usable() {
            return None;
        }

        let key = cache_key(from, to);
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.entries.get(&key).copied() {
            if now.saturating_duration_since(cached.computed_at) < self.ttl {
                inner.hits += 1;
                return Some(cached.km);
            }
            inner.entries.shift_remove(&key);
        }

        inner.misses += 1;
        let km = round_km(haversine_m(from, to));
        inner.entries.insert(
            key,
            CachedDistance {
                km,
                computed_at: now,
            },
        );
        while inner.entries.len() > self.capacity {
            inner.entries.shift_remove_index(0);
        }
        Some(km)
    }

    /// Drop every entry and reset counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    /// Configured entry bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DistanceCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE_OFFICE: Coordinate = Coordinate::new(13.736717, 100.523186);
    const TOWER_CRANE: Coordinate = Coordinate::new(13.741, 100.53);

    #[test]
    fn known_distances() {
        let cache = DistanceCache::default();
        assert_eq!(cache.distance_km(Some(SITE_OFFICE), Some(TOWER_CRANE)), Some(0.88));
        assert_eq!(
            cache.distance_km(Some(Coordinate::new(0.0, 0.0)), Some(Coordinate::new(0.0, 1.0))),
            Some(111.32)
        );
        assert!((haversine_m(SITE_OFFICE, TOWER_CRANE) - 877.63).abs() < 0.01);
    }

    #[test]
    fn missing_or_non_finite_points_yield_none() {
        let cache = DistanceCache::default();
        assert_eq!(cache.distance_km(None, Some(TOWER_CRANE)), None);
        assert_eq!(cache.distance_km(Some(SITE_OFFICE), None), None);
        assert_eq!(
            cache.distance_km(Some(Coordinate::new(f64::NAN, 100.5)), Some(TOWER_CRANE)),
            None
        );
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn repeated_lookups_within_ttl_hit_the_cache() {
        let cache = DistanceCache::default();
        let start = Instant::now();
        let first = cache.distance_km_at(Some(SITE_OFFICE), Some(TOWER_CRANE), start);
        let second = cache.distance_km_at(
            Some(SITE_OFFICE),
            Some(TOWER_CRANE),
            start + Duration::from_secs(29),
        );
        assert_eq!(first, second);
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[test]
    fn expired_entries_are_recomputed() {
        let cache = DistanceCache::new(Duration::from_secs(30), 10);
        let start = Instant::now();
        cache.distance_km_at(Some(SITE_OFFICE), Some(TOWER_CRANE), start);
        cache.distance_km_at(
            Some(SITE_OFFICE),
            Some(TOWER_CRANE),
            start + Duration::from_secs(30),
        );
        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn capacity_evicts_oldest_inserted_first() {
        let cache = DistanceCache::new(Duration::from_secs(30), 3);
        let now = Instant::now();
        let origin = Some(SITE_OFFICE);
        let target = |step: u32| Some(Coordinate::new(13.74 + f64::from(step) * 0.001, 100.53));
        for step in 0..5 {
            cache.distance_km_at(origin, target(step), now);
            assert!(cache.stats().entries <= cache.capacity());
        }
        assert_eq!(cache.stats().entries, 3);

        // The first two targets were evicted; the newest is still cached.
        cache.distance_km_at(origin, target(4), now);
        assert_eq!(cache.stats().hits, 1);
        cache.distance_km_at(origin, target(0), now);
        assert_eq!(cache.stats().misses, 6);
    }

    #[test]
    fn clear_resets_entries_and_counters() {
        let cache = DistanceCache::default();
        cache.distance_km(Some(SITE_OFFICE), Some(TOWER_CRANE));
        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn coordinates_parse_from_pairs() {
        let parsed: Coordinate = "13.736717, 100.523186".parse().expect("valid pair");
        assert_eq!(parsed, SITE_OFFICE);
        assert!("13.7".parse::<Coordinate>().is_err());
        assert!("north,100".parse::<Coordinate>().is_err());
    }
}
