// Cooperative emergency stop across observers: bounded observation latency,
// no further tracked mutation after the stop, explicit reset, idempotent
// re-raise, and the persisted single-line signal format.

use maintguard::{
    EmergencyStopCoordinator, OperationJournal, SafetyError, StopSignal, StopState, StopToken,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    coordinator: EmergencyStopCoordinator,
    journal: OperationJournal,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let journal = OperationJournal::open(dir.path().join("journal.log")).unwrap();
    let coordinator = EmergencyStopCoordinator::new(
        dir.path().join("emergency_stop"),
        Duration::from_millis(200),
    );
    Fixture {
        coordinator,
        journal,
        _dir: dir,
    }
}

#[test]
fn raise_is_observed_within_polling_bound() {
    let fx = fixture();
    let token = fx.coordinator.token();

    let mutations = Arc::new(AtomicUsize::new(0));
    let worker_mutations = mutations.clone();
    let worker = thread::spawn(move || {
        // A tracked loop: stop check at every step boundary
        for _ in 0..1000 {
            if token.check() {
                return true;
            }
            worker_mutations.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
        }
        false
    });

    thread::sleep(Duration::from_millis(50));
    fx.coordinator
        .raise("operator abort", &fx.journal, None)
        .unwrap();
    let raised_at = Instant::now();

    let observed = worker.join().unwrap();
    let latency = raised_at.elapsed();

    assert!(observed, "worker must observe the stop");
    assert!(
        latency < Duration::from_millis(500),
        "stop observed after {:?}",
        latency
    );

    // No further tracked mutation once observed
    let frozen = mutations.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mutations.load(Ordering::SeqCst), frozen);
}

#[test]
fn multiple_observers_see_one_signal() {
    let fx = fixture();
    let tokens: Vec<StopToken> = (0..4).map(|_| fx.coordinator.token()).collect();

    for token in &tokens {
        assert!(!token.check());
    }

    fx.coordinator.raise("shared", &fx.journal, None).unwrap();

    for token in &tokens {
        assert!(token.check());
        assert_eq!(token.reason().as_deref(), Some("shared"));
    }
}

#[test]
fn reset_then_check_is_false() {
    let fx = fixture();
    let token = fx.coordinator.token();

    fx.coordinator.raise("pause", &fx.journal, None).unwrap();
    assert!(token.check());
    assert_eq!(fx.coordinator.state(), StopState::Stopped);

    fx.coordinator.reset(&fx.journal).unwrap();
    assert_eq!(fx.coordinator.state(), StopState::Normal);
    assert!(!token.check());
}

#[test]
fn re_raise_while_stopped_is_noop() {
    let fx = fixture();

    let first = fx.coordinator.raise("first", &fx.journal, None).unwrap();
    let second = fx.coordinator.raise("second", &fx.journal, None).unwrap();

    assert_eq!(second.reason, first.reason);
    assert_eq!(second.raised_at, first.raised_at);

    // Workers never clear the signal; only reset does
    assert_eq!(fx.coordinator.state(), StopState::Stopped);
}

#[test]
fn signal_file_is_single_line_wire_format() {
    let dir = TempDir::new().unwrap();
    let journal = OperationJournal::open(dir.path().join("journal.log")).unwrap();
    let signal_path = dir.path().join("emergency_stop");
    let coordinator = EmergencyStopCoordinator::new(&signal_path, Duration::from_secs(1));

    coordinator
        .raise("disk /dev/sda failing", &journal, None)
        .unwrap();

    let content = fs::read_to_string(&signal_path).unwrap();
    let line = content.trim_end();
    assert_eq!(content.lines().count(), 1);
    assert!(line.starts_with("EMERGENCY_STOP:disk /dev/sda failing:"));

    let parsed = StopSignal::parse(line).unwrap();
    assert_eq!(parsed.reason, "disk /dev/sda failing");
}

#[test]
fn stop_event_is_journaled_as_safety_error() {
    let fx = fixture();
    fx.coordinator
        .raise("watchdog", &fx.journal, Some("s1"))
        .unwrap();

    let records = fx.journal.read_all().unwrap();
    let found = records.iter().any(|r| {
        matches!(
            r,
            maintguard::JournalRecord::Event {
                severity: maintguard::EventSeverity::SafetyError,
                message,
                session_id: Some(sid),
                ..
            } if message == "EMERGENCY_STOP:watchdog" && sid == "s1"
        )
    });
    assert!(found, "SAFETY_ERROR event must be journaled");
}

#[test]
fn ensure_clear_surfaces_the_reason() {
    let fx = fixture();
    let token = fx.coordinator.token();

    fx.coordinator
        .raise("cooling failure", &fx.journal, None)
        .unwrap();

    match token.ensure_clear() {
        Err(SafetyError::EmergencyStop { reason }) => {
            assert_eq!(reason, "cooling failure");
        }
        other => panic!("expected EmergencyStop, got {:?}", other),
    }
}
