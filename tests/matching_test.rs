mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use geo::HaversineDistance;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use dispatch::audit::{AuditEvent, AuditRecord, AuditWriter, ChannelAuditSink};
use dispatch::config::DispatchConfig;
use dispatch::error::DispatchError;
use dispatch::fleet::{haversine_km, DriverRegistry, DriverState, GeoPoint};
use dispatch::matching::MatchingEngine;
use dispatch::service::DispatchService;
use common::*;

/// Closest eligible driver by exhaustive scan, ties to the smaller id
fn brute_force_nearest(
    drivers: &HashMap<String, (GeoPoint, bool)>,
    origin: &GeoPoint,
    radius_km: f64,
) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for (id, (position, available)) in drivers {
        if !available {
            continue;
        }
        let d = haversine_km(origin, position);
        if d > radius_km {
            continue;
        }
        best = match best {
            Some((best_id, best_d)) if best_d < d || (best_d == d && best_id < *id) => Some((best_id, best_d)),
            _ => Some((id.clone(), d)),
        };
    }
    best
}

#[test]
fn test_nearest_agrees_with_exhaustive_scan() {
    let mut rng = StdRng::seed_from_u64(7);
    let registry = DriverRegistry::default();
    let mut drivers = HashMap::new();

    for i in 0..600 {
        let lat = rng.gen_range(52.35..52.65);
        let lng = rng.gen_range(13.15..13.65);
        let available = rng.gen_bool(0.7);
        let id = format!("driver-{:04}", i);
        let position = point(lat, lng);
        registry.upsert(&id, position, available).unwrap();
        drivers.insert(id, (position, available));
    }

    for _ in 0..200 {
        let origin = point(rng.gen_range(52.30..52.70), rng.gen_range(13.10..13.70));
        let radius_km = rng.gen_range(0.2..25.0);

        let found = registry
            .query_nearest(&origin, radius_km, &HashSet::new())
            .unwrap()
            .map(|n| (n.driver_id, n.distance_km));
        let expected = brute_force_nearest(&drivers, &origin, radius_km);

        assert_eq!(
            found, expected,
            "origin ({}, {}) radius {}",
            origin.lat(), origin.lng(), radius_km
        );
    }
}

#[test]
fn test_haversine_matches_reference_implementation() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..100 {
        let a = point(rng.gen_range(-80.0..80.0), rng.gen_range(-179.0..179.0));
        let b = point(rng.gen_range(-80.0..80.0), rng.gen_range(-179.0..179.0));

        let ours = haversine_km(&a, &b);
        let reference_km = geo::Point::from(a).haversine_distance(&geo::Point::from(b)) / 1000.0;
        // geo uses the IUGG mean radius (6371.0088 km)
        assert!(
            (ours - reference_km).abs() <= reference_km * 1e-5 + 1e-9,
            "{} vs {}",
            ours,
            reference_km
        );
    }
}

#[test]
fn test_stale_and_offline_drivers_are_skipped() {
    let registry = DriverRegistry::new(
        dispatch::fleet::DEFAULT_RESOLUTION,
        time::Duration::seconds(30),
        time::Duration::seconds(10),
    );
    let now = time::OffsetDateTime::now_utc();
    let origin = point(BERLIN.0, BERLIN.1);

    registry.upsert_at("stale", origin, true, now - time::Duration::seconds(31)).unwrap();
    registry.upsert_at("offline", origin, false, now).unwrap();
    let (lat, lng) = berlin_offset(2_000.0, 0.0);
    registry.upsert_at("fresh", point(lat, lng), true, now).unwrap();

    let found = registry
        .query_nearest_at(&origin, 5.0, &HashSet::new(), now)
        .unwrap()
        .unwrap();
    assert_eq!(found.driver_id, "fresh");

    // The stale driver is rejected by the reservation too
    assert!(matches!(
        registry.reserve_at("stale", "r", "s", now),
        Err(DispatchError::ReservationConflict(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_matches_reserve_each_driver_once() {
    let (service, _) = test_service(DispatchConfig::default());
    for i in 0..5 {
        let (lat, lng) = berlin_offset(100.0 * i as f64, 0.0);
        service.update_driver(update(&format!("d{}", i), (lat, lng), true)).unwrap();
    }

    let tasks = (0..40).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            service.match_rider(match_body(&format!("r{}", i), &format!("s{}", i), BERLIN, Some(5.0)))
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let matched: Vec<String> = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.driver_id.clone())
        .collect();
    let unique: HashSet<&String> = matched.iter().collect();

    // No driver was handed to two riders
    assert_eq!(unique.len(), matched.len());
    assert!(matched.len() <= 5);
    assert_eq!(service.registry().stats().reserved, matched.len());

    // A rider that lost every retry leaves its drivers for later requests
    let mut total = matched.len();
    while service
        .match_rider(match_body("late", &format!("late-{}", total), BERLIN, Some(5.0)))
        .unwrap()
        .success
    {
        total += 1;
    }
    assert_eq!(total, 5);
    assert_eq!(service.registry().stats().reserved, 5);
}

#[test]
fn test_contended_driver_has_single_winner_across_threads() {
    let (service, _) = test_service(DispatchConfig::default());
    service.update_driver(update("only", BERLIN, true)).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let service = service.clone();
            std::thread::spawn(move || {
                service
                    .match_rider(match_body("r", &format!("s{}", i), BERLIN, Some(1.0)))
                    .unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|r| r.success)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn test_held_driver_is_skipped_for_next_closest() {
    let registry = DriverRegistry::default();
    let audit = Arc::new(dispatch::audit::MemoryAuditSink::new());
    let engine = MatchingEngine::new(registry.clone(), audit);

    registry.upsert("near", point(BERLIN.0, BERLIN.1), true).unwrap();
    let (lat, lng) = berlin_offset(1_000.0, 0.0);
    registry.upsert("far", point(lat, lng), true).unwrap();

    // Another session takes the closest driver first
    registry.reserve("near", "other", "other-session").unwrap();

    let result = engine
        .match_request(&dispatch::matching::MatchRequest {
            rider_id: "r".to_string(),
            session_id: "s".to_string(),
            lat: BERLIN.0,
            lng: BERLIN.1,
            radius_km: 5.0,
        })
        .unwrap();
    assert_eq!(result.driver_id.as_deref(), Some("far"));
}

#[tokio::test]
async fn test_sweeper_releases_unconfirmed_reservation() {
    let config = DispatchConfig {
        reservation_timeout_ms: 50,
        sweep_interval_ms: 10,
        ..DispatchConfig::default()
    };
    let (service, _) = test_service(config);
    service.update_driver(update("d1", BERLIN, true)).unwrap();
    let sweeper = service.start_sweeper();

    let first = service.match_rider(match_body("r1", "s1", BERLIN, None)).unwrap();
    assert!(first.success);
    assert_eq!(service.get_driver("d1").unwrap().state, DriverState::Reserved);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.get_driver("d1").unwrap().state, DriverState::Available);

    let second = service.match_rider(match_body("r2", "s2", BERLIN, None)).unwrap();
    assert_eq!(second.driver_id.as_deref(), Some("d1"));

    // Too late to confirm the expired hold
    let late = service.confirm(dispatch::models::ReservationAction {
        driver_id: "d1".to_string(),
        session_id: "s1".to_string(),
    });
    assert!(matches!(late, Err(DispatchError::InvalidTransition(_))));

    sweeper.abort();
}

struct CollectingWriter(Arc<Mutex<Vec<AuditEvent>>>);

#[async_trait]
impl AuditWriter for CollectingWriter {
    async fn write(&self, event: &AuditEvent) -> Result<(), DispatchError> {
        self.0.lock().push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_audit_events_flow_through_channel() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let (sink, writer) = ChannelAuditSink::spawn(16, CollectingWriter(written.clone()));
    let service = DispatchService::new(DispatchConfig::default(), Arc::new(sink)).unwrap();
    service.update_driver(update("d1", BERLIN, true)).unwrap();

    service.match_rider(match_body("rider-1", "session-1", BERLIN, None)).unwrap();
    drop(service);
    writer.await.unwrap();

    let events = written.lock().clone();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].id, events[1].id);
    assert!(events[0].timestamp <= events[1].timestamp);
    assert!(events[0].to_string().starts_with("MATCH_REQUEST rider_id=rider-1"));
    match &events[1].record {
        AuditRecord::MatchOutcome { rider_id, driver_id, session_id, success, .. } => {
            assert_eq!(rider_id, "rider-1");
            assert_eq!(driver_id.as_deref(), Some("d1"));
            assert_eq!(session_id, "session-1");
            assert!(*success);
        }
        other => panic!("unexpected record {:?}", other),
    }
}
