//! Integration tests for the actor runtime.
//!
//! Runs every party as a tokio task on the in-memory network with paused
//! time, so hold windows, ack retries and completion timers all advance on
//! the same virtual clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capnet_agent::InMemoryNetwork;
use capnet_market::{JsonFileRegistry, ProviderRecord, ProviderRegistry};
use capnet_proto::Envelope;
use capnetd::config::{ProviderSection, RequesterSection};
use capnetd::simulation::REGISTRATION_GRACE;
use capnetd::{Simulation, SimulationConfig};
use chrono::Utc;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helper Functions
// ============================================================================

fn provider(id: &str, capacity: u64, price_per_unit: f64) -> ProviderSection {
    ProviderSection {
        id: id.to_string(),
        capacity,
        price_per_unit,
        ..ProviderSection::default()
    }
}

fn requester(id: &str, required_units: u64, budget: f64) -> RequesterSection {
    RequesterSection {
        id: id.to_string(),
        required_units,
        budget,
        ..RequesterSection::default()
    }
}

fn is_label(envelope: &Envelope, label: &str) -> bool {
    envelope.open().is_ok_and(|m| m.label() == label)
}

/// Records when the first call for proposal goes out; optionally drops every join.
fn watch_first_cfp(network: &InMemoryNetwork, drop_joins: bool) -> Arc<Mutex<Option<Instant>>> {
    let first_cfp = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&first_cfp);
    network.add_drop_rule(move |envelope| {
        if is_label(envelope, "cfp") {
            seen.lock().unwrap().get_or_insert_with(Instant::now);
        }
        drop_joins && is_label(envelope, "inform(join)")
    });
    first_cfp
}

// ============================================================================
// End-to-End Runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sample_config_runs_to_completion() {
    let report = Simulation::new(SimulationConfig::sample())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_finished());
    assert_eq!(report.completed, 4);
    assert_eq!(report.confirmed, 4);
    assert!(report.requesters.iter().all(|r| r.lost == 0));
    let jobs_done: u32 = report.providers.iter().map(|p| p.jobs_done).sum();
    assert_eq!(jobs_done, 4);
}

#[tokio::test(start_paused = true)]
async fn sole_provider_serves_competing_requesters_one_hold_at_a_time() {
    let config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![
            requester("r1", 20, 100.0),
            requester("r2", 20, 100.0),
            requester("r3", 20, 100.0),
        ],
        ..SimulationConfig::default()
    };

    let report = Simulation::new(config).run(CancellationToken::new()).await.unwrap();

    assert!(report.all_finished());
    assert_eq!(report.confirmed, 3);
    assert_eq!(report.providers[0].jobs_done, 3);
    // Competing calls found the provider held and retried later
    assert!(report.no_match > 0);
    assert!(report.requesters.iter().map(|r| r.requests_sent).sum::<u32>() > 3);
}

#[tokio::test(start_paused = true)]
async fn over_budget_requester_never_books() {
    let config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![requester("cheap", 20, 5.0), requester("fair", 20, 100.0)],
        time_limit_secs: Some(100),
        ..SimulationConfig::default()
    };

    let report = Simulation::new(config).run(CancellationToken::new()).await.unwrap();

    let cheap = report.requesters.iter().find(|r| r.id == "cheap").unwrap();
    let fair = report.requesters.iter().find(|r| r.id == "fair").unwrap();
    assert_eq!(cheap.completed, 0);
    assert!(!cheap.finished);
    assert!(fair.finished);
    assert!(report.rejected >= 1);
    assert_eq!(report.expired, 0);
}

// ============================================================================
// Failure Recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lost_completion_is_recovered_by_re_requesting() {
    let network = Arc::new(InMemoryNetwork::new());
    let dropped_once = AtomicBool::new(false);
    network.add_drop_rule(move |envelope| {
        is_label(envelope, "inform(completion)") && !dropped_once.swap(true, Ordering::SeqCst)
    });
    let config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![requester("r", 20, 100.0)],
        ..SimulationConfig::default()
    };

    let sim = Simulation::with_network(config, Arc::clone(&network));
    let report = sim.run(CancellationToken::new()).await.unwrap();

    let r = &report.requesters[0];
    assert!(r.finished);
    assert_eq!(r.lost, 1);
    assert_eq!(r.completed, 1);
    assert_eq!(report.completed, 2);
    assert_eq!(network.dropped(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_acks_are_retried_until_registered() {
    let network = Arc::new(InMemoryNetwork::new());
    let dropped_once = AtomicBool::new(false);
    network.add_drop_rule(move |envelope| {
        is_label(envelope, "inform(ack)") && !dropped_once.swap(true, Ordering::SeqCst)
    });
    let config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![requester("r", 20, 100.0)],
        ..SimulationConfig::default()
    };

    let report = Simulation::with_network(config, Arc::clone(&network))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_finished());
    assert_eq!(report.providers[0].phase, "Ready");
    assert_eq!(network.dropped(), 1);
}

#[tokio::test(start_paused = true)]
async fn departing_provider_finishes_queued_work() {
    let mut leaving = provider("leaving", 100, 0.5);
    leaving.leave_after_ms = Some(500);
    let config = SimulationConfig {
        providers: vec![leaving, provider("staying", 100, 1.0)],
        requesters: vec![requester("r", 20, 100.0)],
        time_limit_secs: Some(200),
        ..SimulationConfig::default()
    };
    let report = Simulation::new(config).run(CancellationToken::new()).await.unwrap();

    assert!(report.all_finished());
    let leaving = report.providers.iter().find(|p| p.id == "leaving").unwrap();
    assert_eq!(leaving.phase, "Left");
}

// ============================================================================
// Shutdown And Persistence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn external_shutdown_stops_an_unfinishable_run() {
    let config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![requester("r", 20, 1.0)],
        ..SimulationConfig::default()
    };
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(Simulation::new(config).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(100)).await;
    shutdown.cancel();
    let report = run.await.unwrap().unwrap();

    assert!(!report.all_finished());
    assert!(report.requesters[0].requests_sent >= 3);
}

#[tokio::test(start_paused = true)]
async fn registry_snapshot_outlives_the_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.json");
    let mut config = SimulationConfig::sample();
    config.broker.registry_path = Some(path.clone());

    let report = Simulation::new(config).run(CancellationToken::new()).await.unwrap();
    assert!(report.all_finished());

    let reopened = JsonFileRegistry::open(&path);
    let records = reopened.snapshot().unwrap();
    let capacities: Vec<_> = records.iter().map(|r| (r.id.to_string(), r.capacity)).collect();
    assert_eq!(
        capacities,
        vec![("provider-1".to_string(), 45), ("provider-2".to_string(), 35)]
    );
}

#[tokio::test(start_paused = true)]
async fn requesters_start_once_providers_join() {
    let network = Arc::new(InMemoryNetwork::new());
    let first_cfp = watch_first_cfp(&network, false);
    let config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![requester("r", 20, 100.0)],
        ..SimulationConfig::default()
    };
    let started = Instant::now();

    let report = Simulation::with_network(config, network).run(CancellationToken::new()).await.unwrap();

    assert!(report.all_finished());
    let first = first_cfp.lock().unwrap().expect("a cfp was sent");
    assert!(first - started < REGISTRATION_GRACE);
}

#[tokio::test(start_paused = true)]
async fn persisted_records_do_not_count_as_registrations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.json");
    JsonFileRegistry::open(&path)
        .upsert(ProviderRecord::new("p".into(), 100, 1.0, Utc::now(), Utc::now()))
        .unwrap();

    let network = Arc::new(InMemoryNetwork::new());
    let first_cfp = watch_first_cfp(&network, true);
    let mut config = SimulationConfig {
        providers: vec![provider("p", 100, 1.0)],
        requesters: vec![requester("r", 20, 100.0)],
        time_limit_secs: Some(60),
        ..SimulationConfig::default()
    };
    config.broker.registry_path = Some(path);
    let started = Instant::now();

    Simulation::with_network(config, network).run(CancellationToken::new()).await.unwrap();

    // The provider never got through, so requesters waited out the grace period
    let first = first_cfp.lock().unwrap().expect("a cfp was sent");
    assert!(first - started >= REGISTRATION_GRACE);
}

#[tokio::test(start_paused = true)]
async fn report_serializes_as_json() {
    let report = Simulation::new(SimulationConfig::sample())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["completed"], 4);
    assert_eq!(json["requesters"].as_array().map(Vec::len), Some(4));
    assert_eq!(json["providers"][0]["id"], "provider-1");
}
