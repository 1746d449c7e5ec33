//! Call Session Integration Tests
//!
//! Facade-level behavior: initialization with degraded media or degraded
//! signaling, teardown, and what one side sees when the other leaves.

mod harness;

use consult_rtc::media::SyntheticMediaSource;
use consult_rtc::signaling::memory::MemoryRelay;
use consult_rtc::{EnginePhase, Error, Role, SessionEvent, TrackKind, TransportKind};
use harness::{count_disconnects, init_logging, FakeNetwork, PeerOptions, TestPeer};
use std::time::Duration;

const DOCTOR: &str = "doc-a";
const PATIENT: &str = "pat-b";

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_call_is_idempotent() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let mut doctor = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());
    let mut patient =
        TestPeer::memory(&relay, &network, PATIENT, Role::Patient, PeerOptions::default());

    doctor.session.initialize().await.unwrap();
    patient.session.initialize().await.unwrap();
    doctor.wait_connected(secs(5)).await;

    tokio::join!(doctor.session.end_call(), doctor.session.end_call());
    doctor.session.end_call().await;

    assert!(doctor.session.is_ended());
    assert_eq!(doctor.session.phase(), EnginePhase::Ended);
    assert!(!relay.status(doctor.session.room()).doctor_joined);
    let media = doctor.session.local_media();
    assert!(media.is_none());

    // Operations after the end are no-ops
    doctor.session.toggle_video(false);
    doctor.session.reconnect();
    assert!(doctor.session.initialize().await.is_err());
    tokio::time::sleep(secs(30)).await;
    assert_eq!(doctor.session.phase(), EnginePhase::Ended);
    assert!(doctor
        .drain()
        .iter()
        .all(|e| !matches!(e, SessionEvent::Reconnecting | SessionEvent::Error(_))));

    patient.session.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_end_call_before_initialize() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let peer = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());

    peer.session.end_call().await;
    assert_eq!(peer.session.phase(), EnginePhase::Ended);
    assert!(matches!(
        peer.session.initialize().await,
        Err(Error::SessionEnded(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_ended_media_tracks_are_stopped() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let peer = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());

    peer.session.initialize().await.unwrap();
    let media = peer.session.local_media().unwrap();
    assert!(media.tracks().iter().all(|t| !t.is_stopped()));

    peer.session.end_call().await;
    assert!(media.tracks().iter().all(|t| t.is_stopped()));
}

#[tokio::test(start_paused = true)]
async fn test_peer_leaving_reports_one_drop_after_grace() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let mut doctor = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());
    let mut patient =
        TestPeer::memory(&relay, &network, PATIENT, Role::Patient, PeerOptions::default());

    doctor.session.initialize().await.unwrap();
    patient.session.initialize().await.unwrap();
    doctor.wait_connected(secs(5)).await;
    patient.wait_connected(secs(5)).await;
    doctor.drain();

    patient.session.end_call().await;

    // Inside the grace period nothing is reported yet
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let early = doctor.drain();
    assert_eq!(count_disconnects(&early, false), 0);
    assert_eq!(doctor.session.phase(), EnginePhase::Disconnecting);

    doctor
        .wait_for(secs(1), "drop after grace", |e| {
            matches!(e, SessionEvent::PeerDisconnected { permanent: false })
        })
        .await;

    // Reconnection runs out against an empty room
    doctor
        .wait_for(secs(60), "permanent drop", |e| {
            matches!(e, SessionEvent::PeerDisconnected { permanent: true })
        })
        .await;
    tokio::time::sleep(secs(60)).await;
    assert_eq!(count_disconnects(&doctor.drain(), false), 0);
    assert_eq!(doctor.session.phase(), EnginePhase::Failed);

    doctor.session.end_call().await;
    assert_eq!(doctor.session.phase(), EnginePhase::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_rebuilds_the_link() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let mut doctor = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());
    let mut patient =
        TestPeer::memory(&relay, &network, PATIENT, Role::Patient, PeerOptions::default());

    doctor.session.initialize().await.unwrap();
    patient.session.initialize().await.unwrap();
    doctor.wait_connected(secs(5)).await;
    patient.wait_connected(secs(5)).await;
    let generation = doctor.session.stats().generation;

    doctor.session.reconnect();
    doctor
        .wait_for(secs(1), "reconnecting", |e| matches!(e, SessionEvent::Reconnecting))
        .await;
    // A second request during the cooldown is absorbed
    doctor.session.reconnect();

    doctor.wait_connected(secs(10)).await;
    patient.wait_connected(secs(10)).await;
    assert_eq!(doctor.session.stats().generation, generation + 1);
    assert_eq!(doctor.session.phase(), EnginePhase::Connected);
    assert_eq!(network.connected_links(), 2);

    doctor.session.end_call().await;
    patient.session.end_call().await;
}

// ============================================================================
// Media acquisition
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_camera_degrades_to_audio_only() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let options = PeerOptions {
        media: SyntheticMediaSource {
            has_camera: false,
            has_microphone: true,
        },
        ..Default::default()
    };
    let mut peer = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, options);

    peer.session.initialize().await.unwrap();
    let event = peer
        .wait_for(secs(1), "local stream", |e| {
            matches!(e, SessionEvent::LocalStream(_))
        })
        .await;
    if let SessionEvent::LocalStream(media) = event {
        assert!(!media.has_video());
        assert!(media.track(TrackKind::Audio).is_some());
    }
    peer.wait_phase(EnginePhase::Connecting, secs(1)).await;

    // Toggling the absent camera is harmless
    peer.session.toggle_video(false);
    tokio::time::sleep(secs(1)).await;
    assert_eq!(peer.session.phase(), EnginePhase::Connecting);

    peer.session.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_devices_fails_initialization() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let options = PeerOptions {
        media: SyntheticMediaSource {
            has_camera: false,
            has_microphone: false,
        },
        ..Default::default()
    };
    let mut peer = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, options);

    let result = peer.session.initialize().await;
    assert!(matches!(result, Err(Error::MediaUnavailable(_))));
    assert_eq!(peer.session.phase(), EnginePhase::Failed);
    assert!(peer
        .drain()
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(_))));

    // Never joined, never built a link
    assert!(!relay.status(peer.session.room()).doctor_joined);
    assert_eq!(network.open_links(), 0);

    peer.session.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_link_creation_failure_is_reported() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    network.set_refuse_links(true);
    let mut peer = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());

    peer.session.initialize().await.unwrap();
    peer.wait_for(secs(1), "error", |e| matches!(e, SessionEvent::Error(_)))
        .await;
    peer.wait_phase(EnginePhase::Failed, secs(1)).await;

    peer.session.end_call().await;
}

// ============================================================================
// Signaling degradation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stalled_primary_falls_back_transparently() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    relay.set_connect_stalled(TransportKind::Primary, true);
    let mut doctor = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());
    let mut patient =
        TestPeer::memory(&relay, &network, PATIENT, Role::Patient, PeerOptions::default());

    let started = tokio::time::Instant::now();
    doctor.session.initialize().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(6000), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(7000), "took {:?}", elapsed);
    assert!(relay.status(doctor.session.room()).doctor_joined);

    patient.session.initialize().await.unwrap();
    doctor.wait_connected(secs(10)).await;
    patient.wait_connected(secs(10)).await;

    assert_eq!(doctor.session.stats().transport, TransportKind::Fallback);
    assert_eq!(patient.session.stats().transport, TransportKind::Fallback);
    let sent = relay.sent();
    assert!(!sent.is_empty());
    assert!(sent.iter().all(|r| r.via == TransportKind::Fallback));

    doctor.session.end_call().await;
    patient.session.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_enters_direct_mode_then_gives_up() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    relay.set_available(TransportKind::Primary, false);
    relay.set_available(TransportKind::Fallback, false);
    let mut peer = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());

    peer.session.initialize().await.unwrap();
    assert_eq!(peer.session.stats().transport, TransportKind::Direct);
    peer.wait_phase(EnginePhase::Connecting, secs(1)).await;

    // Offers keep being re-issued while waiting
    tokio::time::sleep(secs(12)).await;
    assert!(network.offers(DOCTOR) >= 3);

    peer.wait_for(secs(30), "direct mode give-up", |e| {
        matches!(e, SessionEvent::Error(_))
    })
    .await;
    assert_eq!(peer.session.phase(), EnginePhase::Failed);

    let offers = network.offers(DOCTOR);
    tokio::time::sleep(secs(60)).await;
    assert_eq!(network.offers(DOCTOR), offers);

    peer.session.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_relay_returning_after_direct_mode_rejoins_via_polling() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    relay.set_available(TransportKind::Primary, false);
    relay.set_available(TransportKind::Fallback, false);
    let mut doctor = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());
    let mut patient =
        TestPeer::memory(&relay, &network, PATIENT, Role::Patient, PeerOptions::default());

    doctor.session.initialize().await.unwrap();
    assert_eq!(doctor.session.stats().transport, TransportKind::Direct);
    assert!(!relay.status(doctor.session.room()).doctor_joined);

    tokio::time::sleep(secs(3)).await;
    relay.set_available(TransportKind::Primary, true);
    relay.set_available(TransportKind::Fallback, true);

    // The next direct-mode offer finds the relay again
    tokio::time::sleep(secs(4)).await;
    assert_eq!(doctor.session.stats().transport, TransportKind::Fallback);
    assert!(relay.status(doctor.session.room()).doctor_joined);

    patient.session.initialize().await.unwrap();
    doctor.wait_connected(secs(10)).await;
    patient.wait_connected(secs(10)).await;

    // The direct-mode give-up never fires
    tokio::time::sleep(secs(60)).await;
    assert_eq!(doctor.session.phase(), EnginePhase::Connected);
    assert!(doctor
        .drain()
        .iter()
        .all(|e| !matches!(e, SessionEvent::Error(_))));
    assert!(relay.sent_count(DOCTOR, consult_rtc::signaling::SignalKind::Offer) >= 1);

    doctor.session.end_call().await;
    patient.session.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_persistent_channel_moves_to_polling() {
    init_logging();
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let mut doctor = TestPeer::memory(&relay, &network, DOCTOR, Role::Doctor, PeerOptions::default());
    let mut patient =
        TestPeer::memory(&relay, &network, PATIENT, Role::Patient, PeerOptions::default());
    doctor.session.initialize().await.unwrap();
    patient.session.initialize().await.unwrap();
    doctor.wait_connected(secs(10)).await;
    patient.wait_connected(secs(10)).await;
    assert_eq!(doctor.session.stats().transport, TransportKind::Primary);

    relay.drop_channel(DOCTOR);
    tokio::time::sleep(secs(1)).await;

    assert_eq!(doctor.session.stats().transport, TransportKind::Fallback);
    assert!(relay.status(doctor.session.room()).doctor_joined);
    assert_eq!(doctor.session.phase(), EnginePhase::Connected);
    assert!(patient.session.stats().peer_present);

    // Signaling still flows both ways
    patient.session.toggle_video(false);
    doctor
        .wait_for(secs(5), "remote video off", |e| {
            matches!(
                e,
                SessionEvent::RemoteMediaState {
                    kind: TrackKind::Video,
                    enabled: false
                }
            )
        })
        .await;
    doctor.session.toggle_audio(false);
    patient
        .wait_for(secs(5), "remote audio off", |e| {
            matches!(
                e,
                SessionEvent::RemoteMediaState {
                    kind: TrackKind::Audio,
                    enabled: false
                }
            )
        })
        .await;
    assert!(relay.sent().iter().any(|r| {
        r.via == TransportKind::Fallback
            && r.envelope.sender_id == DOCTOR
            && r.envelope.kind == consult_rtc::signaling::SignalKind::AudioState
    }));

    // The established link was never touched
    assert_eq!(network.connected_links(), 2);
    for peer in [&mut doctor, &mut patient] {
        assert_eq!(count_disconnects(&peer.drain(), false), 0);
        assert_eq!(peer.session.phase(), EnginePhase::Connected);
    }

    doctor.session.end_call().await;
    patient.session.end_call().await;
}
