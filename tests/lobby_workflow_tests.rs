mod utils;

use std::sync::Arc;
use std::time::Duration;

use dungeon_lobby::layout::Difficulty;
use dungeon_lobby::lobby::{
    CloseReason, CreateLobbyRequest, InMemoryLobbyRepository, LobbyRepository, LobbyStatus,
    PlayerId, SqliteLobbyRepository, StopReason,
};
use dungeon_lobby::{AppError, GenerationService, LobbyEvent};
use utils::{wait_for_event, wait_for_status, FlakyLobbyRepository, TestSetupBuilder};

#[tokio::test]
async fn lobby_runs_from_forming_to_closed() {
    let setup = TestSetupBuilder::new().with_capacity(2).build();
    let orchestrator = &setup.orchestrator;

    let lobby = setup.create_lobby("alice", 42).await;
    assert_eq!(lobby.status, LobbyStatus::Forming);

    // The second player fills the lobby and starts assignment
    let joined = orchestrator
        .join_lobby(lobby.id, PlayerId::from("bob"))
        .await
        .unwrap();
    assert_eq!(joined.status, LobbyStatus::Assigning);

    let active = wait_for_status(orchestrator, lobby.id, LobbyStatus::Active).await;
    let layout = active.layout.expect("active lobby should hold its layout");
    assert_eq!(active.lobby.assigned_layout_id, Some(layout.id));

    let closing = orchestrator
        .stop_lobby(lobby.id, StopReason::Completed)
        .await
        .unwrap();
    assert_eq!(closing.status, LobbyStatus::Closing);
    assert_eq!(closing.close_reason, Some(CloseReason::Completed));

    let closed = orchestrator.confirm_teardown(lobby.id).await.unwrap();
    assert_eq!(closed.status, LobbyStatus::Closed);
    // Teardown keeps the reason the lobby started closing for
    assert_eq!(closed.close_reason, Some(CloseReason::Completed));

    for player in ["alice", "bob"] {
        let stats = orchestrator
            .player_stats(&PlayerId::from(player))
            .await
            .unwrap();
        assert_eq!((stats.completed, stats.failed), (1, 0));
    }

    let rejoin = orchestrator
        .join_lobby(lobby.id, PlayerId::from("carol"))
        .await;
    assert!(matches!(
        rejoin,
        Err(AppError::InvalidTransition {
            status: LobbyStatus::Closed,
            ..
        })
    ));
}

#[tokio::test]
async fn events_follow_the_lobby_lifecycle() {
    let setup = TestSetupBuilder::new().with_capacity(2).build();
    let mut events = setup.orchestrator.subscribe();

    let lobby = setup.create_full_lobby(&["alice", "bob"], 3).await;
    wait_for_status(&setup.orchestrator, lobby.id, LobbyStatus::Active).await;

    let mut seen = Vec::new();
    for _ in 0..5 {
        let event = wait_for_event(&mut events, |event| event.lobby_id() == lobby.id).await;
        seen.push(event);
    }

    let types: Vec<&str> = seen.iter().map(LobbyEvent::event_type).collect();
    assert_eq!(
        types,
        vec![
            "lobby_created",
            "player_joined",
            "status_changed",
            "layout_assigned",
            "status_changed",
        ]
    );
    assert!(matches!(
        seen[4],
        LobbyEvent::StatusChanged {
            from: LobbyStatus::Assigning,
            to: LobbyStatus::Active,
            ..
        }
    ));
}

#[tokio::test]
async fn lobbies_with_identical_parameters_share_one_layout() {
    let setup = TestSetupBuilder::new().with_capacity(1).build();
    let orchestrator = &setup.orchestrator;

    // Capacity 1: each lobby starts as soon as it is created
    let first = setup.create_lobby("alice", 1234).await;
    let first = wait_for_status(orchestrator, first.id, LobbyStatus::Active).await;
    let invocations = orchestrator.generation().generator_invocations();

    let second = setup.create_lobby("bob", 1234).await;
    let second = wait_for_status(orchestrator, second.id, LobbyStatus::Active).await;

    assert_eq!(
        first.lobby.assigned_layout_id,
        second.lobby.assigned_layout_id
    );
    assert!(Arc::ptr_eq(
        first.layout.as_ref().unwrap(),
        second.layout.as_ref().unwrap()
    ));
    assert_eq!(
        orchestrator.generation().generator_invocations(),
        invocations
    );
    assert!(orchestrator.generation().cache().stats().await.hits >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrently_created_lobbies_share_one_generation() {
    let setup = TestSetupBuilder::new().with_capacity(1).build();
    let orchestrator = &setup.orchestrator;

    let (first, second) = tokio::join!(
        setup.create_lobby("alice", 4321),
        setup.create_lobby("bob", 4321)
    );
    let first = wait_for_status(orchestrator, first.id, LobbyStatus::Active).await;
    let second = wait_for_status(orchestrator, second.id, LobbyStatus::Active).await;

    assert!(first.lobby.assigned_layout_id.is_some());
    assert_eq!(
        first.lobby.assigned_layout_id,
        second.lobby.assigned_layout_id
    );
    assert!(Arc::ptr_eq(
        first.layout.as_ref().unwrap(),
        second.layout.as_ref().unwrap()
    ));

    // As many generator runs as a single request for the same parameters
    let params = orchestrator.layout_parameters(4321, Difficulty::Medium);
    let reference = GenerationService::from_config(&setup.config);
    reference.request_layout(params).await.unwrap();
    assert_eq!(
        orchestrator.generation().generator_invocations(),
        reference.generator_invocations()
    );

    let stats = orchestrator.generation().cache().stats().await;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.coalesced, 1);
}

#[tokio::test]
async fn layout_of_active_lobby_survives_cache_pressure() {
    let setup = TestSetupBuilder::new()
        .with_capacity(1)
        .with_cache_entries(1)
        .build();
    let orchestrator = &setup.orchestrator;
    let cache = orchestrator.generation().cache();

    let lobby = setup.create_lobby("alice", 10).await;
    let active = wait_for_status(orchestrator, lobby.id, LobbyStatus::Active).await;
    let pinned_key = orchestrator
        .layout_parameters(10, Difficulty::Medium)
        .cache_key();

    for seed in [20, 30] {
        let params = orchestrator.layout_parameters(seed, Difficulty::Medium);
        let layout = orchestrator.request_layout(params).await.unwrap();
        drop(layout);
    }

    let cached = cache
        .get(pinned_key)
        .await
        .expect("layout held by an active lobby must stay cached");
    assert_eq!(Some(cached.id), active.lobby.assigned_layout_id);

    let evicted_key = orchestrator
        .layout_parameters(20, Difficulty::Medium)
        .cache_key();
    assert!(cache.get(evicted_key).await.is_none());
}

#[tokio::test]
async fn forming_lobby_closes_when_last_player_leaves() {
    let setup = TestSetupBuilder::new().build();
    let lobby = setup.create_lobby("alice", 5).await;

    let left = setup
        .orchestrator
        .leave_lobby(lobby.id, PlayerId::from("alice"))
        .await
        .unwrap();

    assert_eq!(left.status, LobbyStatus::Closed);
    assert_eq!(left.close_reason, Some(CloseReason::AllPlayersLeft));

    let stranger = setup
        .orchestrator
        .leave_lobby(lobby.id, PlayerId::from("alice"))
        .await;
    assert!(matches!(stranger, Err(AppError::InvalidTransition { .. })));
}

#[tokio::test]
async fn generation_failure_closes_lobby() {
    // A 1x1 area never fits the two rooms asked for
    let setup = TestSetupBuilder::new()
        .with_capacity(1)
        .with_layout(1, 1, 2)
        .build();

    let lobby = setup.create_lobby("alice", 9).await;
    let closing = wait_for_status(&setup.orchestrator, lobby.id, LobbyStatus::Closing).await;

    assert_eq!(
        closing.lobby.close_reason,
        Some(CloseReason::GenerationFailed)
    );
    assert!(closing.layout.is_none());
    assert_eq!(closing.lobby.assigned_layout_id, None);
}

#[tokio::test]
async fn store_outage_force_closes_only_the_affected_lobby() {
    let repository = FlakyLobbyRepository::new();
    let setup = TestSetupBuilder::new()
        .with_capacity(2)
        .with_materialization_ack()
        .with_store_retry_budget(2)
        .with_repository(Arc::new(repository.clone()))
        .build();
    let orchestrator = &setup.orchestrator;
    let mut events = orchestrator.subscribe();

    let lobby = setup.create_full_lobby(&["alice", "bob"], 77).await;
    wait_for_event(&mut events, |event| {
        matches!(event, LobbyEvent::LayoutAssigned { lobby_id, .. } if *lobby_id == lobby.id)
    })
    .await;
    let bystander = setup.create_lobby("carol", 78).await;

    repository.set_failing(true);
    let result = orchestrator.confirm_materialized(lobby.id).await;
    assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    // One attempt plus two retries
    assert_eq!(repository.failed_writes(), 3);

    wait_for_event(&mut events, |event| {
        matches!(event, LobbyEvent::ReconciliationRequired { lobby_id } if *lobby_id == lobby.id)
    })
    .await;

    let snapshot = orchestrator.get_lobby(lobby.id).await.unwrap();
    assert_eq!(snapshot.lobby.status, LobbyStatus::Closed);
    assert_eq!(
        snapshot.lobby.close_reason,
        Some(CloseReason::StoreUnavailable)
    );
    assert!(snapshot.needs_reconciliation);
    assert_eq!(
        repository.stored(lobby.id).await.unwrap().status,
        LobbyStatus::Assigning
    );

    let untouched = orchestrator.get_lobby(bystander.id).await.unwrap();
    assert_eq!(untouched.lobby.status, LobbyStatus::Forming);
    assert!(!untouched.needs_reconciliation);

    // Still down: the entry stays queued
    assert_eq!(orchestrator.reconcile().await, 0);
    assert_eq!(orchestrator.pending_reconciliation().await, 1);

    repository.set_failing(false);
    assert_eq!(orchestrator.reconcile().await, 1);
    assert_eq!(orchestrator.pending_reconciliation().await, 0);

    let stored = repository.stored(lobby.id).await.unwrap();
    assert_eq!(stored.status, LobbyStatus::Closed);
    assert_eq!(stored.close_reason, Some(CloseReason::StoreUnavailable));

    let join = orchestrator
        .join_lobby(lobby.id, PlayerId::from("dave"))
        .await;
    assert!(matches!(join, Err(AppError::InvalidTransition { .. })));
}

#[tokio::test]
async fn inactive_lobby_times_out_and_records_failed_runs() {
    let setup = TestSetupBuilder::new().with_capacity(1).build();
    let orchestrator = &setup.orchestrator;

    let lobby = setup.create_lobby("alice", 11).await;
    wait_for_status(orchestrator, lobby.id, LobbyStatus::Active).await;

    setup.clock.advance(chrono::Duration::minutes(14));
    orchestrator.sweep().await;
    assert_eq!(
        orchestrator.get_lobby(lobby.id).await.unwrap().lobby.status,
        LobbyStatus::Active
    );

    setup.clock.advance(chrono::Duration::minutes(2));
    orchestrator.sweep().await;

    let closing = orchestrator.get_lobby(lobby.id).await.unwrap();
    assert_eq!(closing.lobby.status, LobbyStatus::Closing);
    assert_eq!(
        closing.lobby.close_reason,
        Some(CloseReason::InactivityTimeout)
    );
    assert!(closing.layout.is_none());

    let stats = orchestrator
        .player_stats(&PlayerId::from("alice"))
        .await
        .unwrap();
    assert_eq!((stats.completed, stats.failed), (0, 1));
}

#[tokio::test]
async fn reported_activity_keeps_an_active_lobby_open() {
    let setup = TestSetupBuilder::new().with_capacity(2).build();
    let orchestrator = &setup.orchestrator;

    let lobby = setup.create_full_lobby(&["alice", "bob"], 12).await;
    wait_for_status(orchestrator, lobby.id, LobbyStatus::Active).await;

    // Play goes on well past the inactivity timeout
    let mut last_activity = lobby.last_activity_at;
    for _ in 0..3 {
        setup.clock.advance(chrono::Duration::minutes(10));
        let touched = orchestrator
            .record_activity(lobby.id, PlayerId::from("bob"))
            .await
            .unwrap();
        assert!(touched.last_activity_at > last_activity);
        last_activity = touched.last_activity_at;
        orchestrator.sweep().await;
        assert_eq!(
            orchestrator.get_lobby(lobby.id).await.unwrap().lobby.status,
            LobbyStatus::Active
        );
    }

    let stranger = orchestrator
        .record_activity(lobby.id, PlayerId::from("carol"))
        .await;
    assert!(matches!(stranger, Err(AppError::PlayerNotInLobby(_))));

    // Silence then times the lobby out
    setup.clock.advance(chrono::Duration::minutes(16));
    orchestrator.sweep().await;
    let closing = orchestrator.get_lobby(lobby.id).await.unwrap();
    assert_eq!(closing.lobby.status, LobbyStatus::Closing);
    assert_eq!(
        closing.lobby.close_reason,
        Some(CloseReason::InactivityTimeout)
    );
}

#[tokio::test]
async fn leaving_an_active_lobby_counts_as_failed_run() {
    let setup = TestSetupBuilder::new().with_capacity(2).build();
    let orchestrator = &setup.orchestrator;

    let lobby = setup.create_full_lobby(&["alice", "bob"], 21).await;
    wait_for_status(orchestrator, lobby.id, LobbyStatus::Active).await;

    let remaining = orchestrator
        .leave_lobby(lobby.id, PlayerId::from("bob"))
        .await
        .unwrap();
    assert_eq!(remaining.status, LobbyStatus::Active);
    assert_eq!(remaining.players, vec![PlayerId::from("alice")]);

    orchestrator
        .stop_lobby(lobby.id, StopReason::Completed)
        .await
        .unwrap();

    let bob = orchestrator
        .player_stats(&PlayerId::from("bob"))
        .await
        .unwrap();
    let alice = orchestrator
        .player_stats(&PlayerId::from("alice"))
        .await
        .unwrap();
    assert_eq!((bob.completed, bob.failed), (0, 1));
    assert_eq!((alice.completed, alice.failed), (1, 0));
}

#[tokio::test]
async fn stop_during_assignment_waits_for_teardown() {
    let setup = TestSetupBuilder::new()
        .with_capacity(3)
        .with_materialization_ack()
        .build();
    let orchestrator = &setup.orchestrator;

    let lobby = setup.create_lobby("alice", 31).await;
    orchestrator.start_lobby(lobby.id).await.unwrap();

    let closing = orchestrator
        .stop_lobby(lobby.id, StopReason::Completed)
        .await
        .unwrap();
    assert_eq!(closing.status, LobbyStatus::Closing);
    assert_eq!(closing.close_reason, Some(CloseReason::Stopped));

    let materialize = orchestrator.confirm_materialized(lobby.id).await;
    assert!(matches!(
        materialize,
        Err(AppError::InvalidTransition {
            status: LobbyStatus::Closing,
            ..
        })
    ));

    let closed = orchestrator.confirm_teardown(lobby.id).await.unwrap();
    assert_eq!(closed.status, LobbyStatus::Closed);

    // Nothing was ever played
    let stats = orchestrator
        .player_stats(&PlayerId::from("alice"))
        .await
        .unwrap();
    assert_eq!(stats.total_runs(), 0);
}

#[tokio::test]
async fn recovered_lobby_regains_its_layout() {
    let repository: Arc<dyn LobbyRepository + Send + Sync> =
        Arc::new(InMemoryLobbyRepository::new());

    let before = TestSetupBuilder::new()
        .with_capacity(1)
        .with_repository(Arc::clone(&repository))
        .build();
    let lobby = before.create_lobby("alice", 55).await;
    let active = wait_for_status(&before.orchestrator, lobby.id, LobbyStatus::Active).await;
    let layout_id = active.lobby.assigned_layout_id.unwrap();

    // A fresh orchestrator over the same store, as after a restart
    let after = TestSetupBuilder::new()
        .with_capacity(1)
        .with_repository(repository)
        .build();
    assert_eq!(after.orchestrator.recover().await.unwrap(), 1);
    assert_eq!(after.orchestrator.recover().await.unwrap(), 0);

    let mut layout = None;
    for _ in 0..200 {
        let snapshot = after.orchestrator.get_lobby(lobby.id).await.unwrap();
        if snapshot.layout.is_some() {
            layout = snapshot.layout;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let layout = layout.expect("recovered lobby should re-pin its layout");
    assert_eq!(layout.id, layout_id);
}

#[tokio::test]
async fn sqlite_store_backs_the_full_lifecycle() {
    let repository = SqliteLobbyRepository::connect("sqlite::memory:")
        .await
        .unwrap();
    let repository: Arc<dyn LobbyRepository + Send + Sync> = Arc::new(repository);
    let setup = TestSetupBuilder::new()
        .with_capacity(2)
        .with_repository(Arc::clone(&repository))
        .build();
    let orchestrator = &setup.orchestrator;

    let request = CreateLobbyRequest {
        difficulty: Some(Difficulty::Epic),
        seed: Some(99),
        capacity: None,
    };
    let lobby = orchestrator
        .create_lobby(PlayerId::from("alice"), request)
        .await
        .unwrap()
        .lobby;
    orchestrator
        .join_lobby(lobby.id, PlayerId::from("bob"))
        .await
        .unwrap();
    wait_for_status(orchestrator, lobby.id, LobbyStatus::Active).await;

    let stored = repository.get_lobby(lobby.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LobbyStatus::Active);
    assert_eq!(stored.difficulty, Difficulty::Epic);
    assert!(stored.assigned_layout_id.is_some());

    orchestrator
        .stop_lobby(lobby.id, StopReason::Requested)
        .await
        .unwrap();
    orchestrator.confirm_teardown(lobby.id).await.unwrap();

    let stored = repository.get_lobby(lobby.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LobbyStatus::Closed);
    assert!(repository.list_active().await.unwrap().is_empty());

    let stats = repository
        .player_stats(&PlayerId::from("bob"))
        .await
        .unwrap();
    assert_eq!((stats.completed, stats.failed), (0, 1));
}
