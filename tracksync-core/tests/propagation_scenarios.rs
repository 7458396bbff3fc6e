mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tracksync_core::model::{
    SelectionOrigin, ShowId, TrackId, TrackSelection, TriggerKind, UserId,
};
use tracksync_core::{
    Execution, IgnoreFilter, InboundEvent, PlaybackEvent, PropagationConfig, PropagationRequest,
    PropagationSource, RouteOutcome, ScanEvent, TriggerPolicy,
};

use support::{FakeServer, Harness, LIBRARY, config, episode_id, tracks};

fn played(user: &UserId, show: &str, season: u32, episode: u32) -> InboundEvent {
    InboundEvent::Played(PlaybackEvent {
        user_id: user.clone(),
        episode_id: episode_id(show, season, episode),
        show_id: None,
        library_id: None,
        tracks: None,
    })
}

fn scanned() -> InboundEvent {
    InboundEvent::Scanned(ScanEvent {
        library_id: Some(LIBRARY.into()),
        show_id: None,
    })
}

#[tokio::test]
async fn foo_end_to_end() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[3]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let mut changes = harness.bus.subscribe();
    let user = UserId::new("1");

    let e1 = episode_id("foo", 1, 1);
    server.select(&e1, &user, tracks("kor", Some("eng")));
    let outcome = harness.router.handle(played(&user, "foo", 1, 1)).await;
    assert_eq!(outcome, RouteOutcome::Propagated { changes: 2 });

    let batch = changes.recv().await.unwrap();
    assert_eq!(batch.trigger, TriggerKind::PlayOrActivity);
    let updated: Vec<_> = batch.changes.iter().map(|c| c.episode_id.clone()).collect();
    assert_eq!(updated, vec![episode_id("foo", 1, 2), episode_id("foo", 1, 3)]);
    for change in &batch.changes {
        assert_eq!(change.applied.audio, TrackId::new("kor"));
        assert_eq!(change.applied.subtitle, Some(TrackId::new("eng")));
        assert_eq!(change.source_episode, e1);
    }
    assert!(server.set_calls().iter().all(|call| call.episode != e1));

    let e4 = server.add_episode("foo", 1, 4);
    let outcome = harness.router.handle(scanned()).await;
    assert_eq!(
        outcome,
        RouteOutcome::Refreshed {
            added: 1,
            updated: 0,
            changes: 1
        }
    );

    let batch = changes.recv().await.unwrap();
    assert_eq!(batch.trigger, TriggerKind::NewEpisode);
    assert_eq!(batch.changes.len(), 1);
    let change = &batch.changes[0];
    assert_eq!(change.episode_id, e4);
    assert_eq!(change.source_episode, e1);
    assert_eq!(change.applied.describe(), "kor / eng");
    assert_eq!(server.selection(&e4, &user), Some(tracks("kor", Some("eng"))));
}

#[tokio::test]
async fn replaying_the_same_selection_is_a_no_op() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[4]);
    let harness = Harness::new(server.clone(), config("show", "all")).await;
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 2), &user, tracks("jpn", None));
    harness.router.handle(played(&user, "foo", 1, 2)).await;
    assert_eq!(server.set_calls().len(), 3);

    server.clear_calls();
    let outcome = harness.router.handle(played(&user, "foo", 1, 2)).await;
    assert_eq!(outcome, RouteOutcome::Propagated { changes: 0 });
    assert!(server.set_calls().is_empty());
}

#[tokio::test]
async fn season_level_never_leaves_the_source_season() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[3, 3]);
    let harness = Harness::new(server.clone(), config("season", "all")).await;
    let user = UserId::new("1");

    server.select(&episode_id("foo", 2, 2), &user, tracks("eng", Some("fre")));
    harness.router.handle(played(&user, "foo", 2, 2)).await;

    let touched: Vec<_> = server.set_calls().into_iter().map(|c| c.episode).collect();
    assert_eq!(touched, vec![episode_id("foo", 2, 1), episode_id("foo", 2, 3)]);
}

#[tokio::test]
async fn ignored_show_is_never_touched() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &["no-sync"], &[3]);
    let harness = Harness::with(
        server.clone(),
        config("show", "all"),
        TriggerPolicy::default(),
        IgnoreFilter::new(["no-sync"], Vec::<String>::new()),
    )
    .await;
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    let before = harness.cache.summary().await;
    assert_eq!(before.ignored_shows, 1);
    assert_eq!(before.episodes, 0);

    let outcome = harness.router.handle(played(&user, "foo", 1, 1)).await;
    assert!(matches!(
        outcome,
        RouteOutcome::Ignored | RouteOutcome::Dropped { .. }
    ));
    server.add_episode("foo", 1, 4);
    harness.router.handle(scanned()).await;

    assert!(server.set_calls().is_empty());
    assert_eq!(harness.cache.summary().await.selections, 0);
}

#[tokio::test]
async fn ignored_library_drops_scan_events() {
    let server = FakeServer::new();
    server.add_library("lib-anime", "Anime");
    server.add_show("lib-anime", "bar", "Bar", &[], &[2]);
    let harness = Harness::with(
        server.clone(),
        config("show", "all"),
        TriggerPolicy::default(),
        IgnoreFilter::new(Vec::<String>::new(), ["Anime"]),
    )
    .await;

    let outcome = harness
        .router
        .handle(InboundEvent::Scanned(ScanEvent {
            library_id: Some("lib-anime".into()),
            show_id: None,
        }))
        .await;
    assert_eq!(outcome, RouteOutcome::Ignored);
    assert!(harness.cache.shows_in_library(&"lib-anime".into()).is_empty());
}

#[tokio::test]
async fn new_episode_without_history_is_left_alone() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[2]);
    server.add_show(LIBRARY, "bar", "Bar", &[], &[2]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let user = UserId::new("1");

    server.select(&episode_id("bar", 1, 1), &user, tracks("kor", None));
    harness.router.handle(played(&user, "bar", 1, 1)).await;
    server.clear_calls();

    let new_foo = server.add_episode("foo", 1, 3);
    let outcome = harness.router.handle(scanned()).await;
    assert_eq!(
        outcome,
        RouteOutcome::Refreshed {
            added: 1,
            updated: 0,
            changes: 0
        }
    );
    assert!(server.set_calls().is_empty());
    assert!(server.selection(&new_foo, &user).is_none());
}

#[tokio::test]
async fn new_episode_takes_the_most_recent_observation() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[4]);
    let harness = Harness::new(server.clone(), config("season", "next")).await;
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 3), &user, tracks("jpn", Some("eng")));
    harness.router.handle(played(&user, "foo", 1, 3)).await;
    server.select(&episode_id("foo", 1, 1), &user, tracks("eng", None));
    harness.router.handle(played(&user, "foo", 1, 1)).await;

    let e5 = server.add_episode("foo", 1, 5);
    harness.router.handle(scanned()).await;

    let applied = harness.cache.episode(&e5).await.unwrap();
    let selection = applied.selection_for(&user).unwrap();
    assert_eq!(selection.describe(), "eng / none");
    assert_eq!(
        selection.origin,
        SelectionOrigin::Propagated {
            from: episode_id("foo", 1, 1)
        }
    );
}

#[tokio::test]
async fn replaced_file_gets_the_selection_back() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[3]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let mut changes = harness.bus.subscribe();
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    harness.router.handle(played(&user, "foo", 1, 1)).await;
    changes.recv().await.unwrap();

    let e2 = episode_id("foo", 1, 2);
    server.replace_file(&e2);
    let outcome = harness.router.handle(scanned()).await;
    assert_eq!(
        outcome,
        RouteOutcome::Refreshed {
            added: 0,
            updated: 1,
            changes: 1
        }
    );
    let batch = changes.recv().await.unwrap();
    assert_eq!(batch.trigger, TriggerKind::UpdatedEpisode);
    assert_eq!(server.selection(&e2, &user), Some(tracks("kor", None)));
}

#[tokio::test]
async fn scan_without_library_refresh_detects_nothing() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[2]);
    let policy = TriggerPolicy {
        refresh_library_on_scan: false,
        ..TriggerPolicy::default()
    };
    let harness =
        Harness::with(server.clone(), config("show", "next"), policy, IgnoreFilter::default()).await;
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    harness.router.handle(played(&user, "foo", 1, 1)).await;

    let e3 = server.add_episode("foo", 1, 3);
    let outcome = harness.router.handle(scanned()).await;
    assert!(matches!(outcome, RouteOutcome::Dropped { .. }));
    assert!(!harness.cache.contains_episode(&e3));
}

#[tokio::test]
async fn disabled_triggers_are_not_handled() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[2]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    let activity = InboundEvent::ActivityChanged(PlaybackEvent {
        user_id: user.clone(),
        episode_id: episode_id("foo", 1, 1),
        show_id: None,
        library_id: None,
        tracks: None,
    });
    assert_eq!(harness.router.handle(activity).await, RouteOutcome::Disabled);
    assert!(server.set_calls().is_empty());
}

#[tokio::test]
async fn uncached_episode_is_loaded_from_the_show_hint() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[2]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let user = UserId::new("1");

    let e3 = server.add_episode("foo", 1, 3);
    let e4 = server.add_episode("foo", 1, 4);
    server.select(&e3, &user, tracks("kor", None));

    let outcome = harness
        .router
        .handle(InboundEvent::Played(PlaybackEvent {
            user_id: user.clone(),
            episode_id: e3.clone(),
            show_id: Some("foo".into()),
            library_id: None,
            tracks: None,
        }))
        .await;
    assert_eq!(outcome, RouteOutcome::Propagated { changes: 1 });
    assert_eq!(server.selection(&e4, &user), Some(tracks("kor", None)));

    let unknown = harness
        .router
        .handle(InboundEvent::Played(PlaybackEvent {
            user_id: user.clone(),
            episode_id: "nowhere".into(),
            show_id: None,
            library_id: None,
            tracks: None,
        }))
        .await;
    assert!(matches!(unknown, RouteOutcome::Dropped { .. }));
}

#[tokio::test]
async fn failing_target_does_not_stop_the_batch() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[4]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let user = UserId::new("1");
    let show = ShowId::new("foo");

    let e2 = episode_id("foo", 1, 2);
    let e3 = episode_id("foo", 1, 3);
    server.fail_updates(&e2, true);
    server.set_languages(&e3, &["jpn"]);
    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));

    let outcome = harness.router.handle(played(&user, "foo", 1, 1)).await;
    assert_eq!(outcome, RouteOutcome::Propagated { changes: 1 });
    assert_eq!(harness.cache.propagation_retries(), vec![(show, user.clone())]);
    assert!(harness.cache.episode(&e2).await.unwrap().selection_for(&user).is_none());

    server.fail_updates(&e2, false);
    let execution = harness
        .engine
        .execute(PropagationRequest {
            show_id: "foo".into(),
            user_id: user.clone(),
            source: PropagationSource::ReapplyLatest,
            trigger: TriggerKind::Scheduler,
        })
        .await
        .unwrap();
    let Execution::Completed { outcome, .. } = execution else {
        panic!("expected a completed propagation, got {execution:?}");
    };
    assert_eq!(outcome.changes.len(), 1);
    assert_eq!(outcome.failures.len(), 1);
    assert!(!outcome.failures[0].retryable);
    assert!(harness.cache.propagation_retries().is_empty());
}

#[tokio::test]
async fn deleted_target_is_pruned() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[3]);
    let harness = Harness::new(server.clone(), config("show", "next")).await;
    let user = UserId::new("1");

    let e2 = episode_id("foo", 1, 2);
    server.delete_silently(&e2);
    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    let outcome = harness.router.handle(played(&user, "foo", 1, 1)).await;

    assert_eq!(outcome, RouteOutcome::Propagated { changes: 1 });
    assert!(!harness.cache.contains_episode(&e2));
    assert!(harness.cache.propagation_retries().is_empty());
}

#[tokio::test]
async fn different_users_keep_separate_selections() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[3]);
    let harness = Harness::new(server.clone(), config("show", "all")).await;
    let alice = UserId::new("1");
    let bob = UserId::new("2");

    server.select(&episode_id("foo", 1, 1), &alice, tracks("kor", Some("eng")));
    server.select(&episode_id("foo", 1, 3), &bob, tracks("eng", None));
    let (a, b) = tokio::join!(
        harness.router.handle(played(&alice, "foo", 1, 1)),
        harness.router.handle(played(&bob, "foo", 1, 3)),
    );
    assert_eq!(a, RouteOutcome::Propagated { changes: 2 });
    assert_eq!(b, RouteOutcome::Propagated { changes: 2 });

    let e2 = episode_id("foo", 1, 2);
    assert_eq!(server.selection(&e2, &alice), Some(tracks("kor", Some("eng"))));
    assert_eq!(server.selection(&e2, &bob), Some(tracks("eng", None)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_play_and_scan_serialize() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[5]);
    let harness = Arc::new(Harness::new(server.clone(), config("show", "next")).await);
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    harness.router.handle(played(&user, "foo", 1, 1)).await;

    server.set_update_delay(std::time::Duration::from_millis(5));
    server.select(&episode_id("foo", 1, 2), &user, tracks("jpn", Some("eng")));
    let e6 = server.add_episode("foo", 1, 6);

    let play = {
        let harness = harness.clone();
        let user = user.clone();
        tokio::spawn(async move { harness.router.handle(played(&user, "foo", 1, 2)).await })
    };
    let scan = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.router.handle(scanned()).await })
    };
    play.await.unwrap();
    scan.await.unwrap();

    for episode in 3..=6 {
        let id = episode_id("foo", 1, episode);
        assert_eq!(
            server.selection(&id, &user),
            Some(tracks("jpn", Some("eng"))),
            "episode {id} diverged"
        );
        let cached = harness.cache.episode(&id).await.unwrap();
        assert_eq!(cached.selection_for(&user).unwrap().describe(), "jpn / eng");
    }
    assert!(harness.cache.contains_episode(&e6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_plays_on_one_pair_end_consistent() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[6]);
    server.set_update_delay(std::time::Duration::from_millis(2));
    let harness = Arc::new(Harness::new(server.clone(), config("show", "all")).await);
    let user = UserId::new("1");

    server.select(&episode_id("foo", 1, 1), &user, tracks("kor", None));
    server.select(&episode_id("foo", 1, 5), &user, tracks("eng", Some("eng")));

    let first = {
        let harness = harness.clone();
        let user = user.clone();
        tokio::spawn(async move { harness.router.handle(played(&user, "foo", 1, 1)).await })
    };
    let second = {
        let harness = harness.clone();
        let user = user.clone();
        tokio::spawn(async move { harness.router.handle(played(&user, "foo", 1, 5)).await })
    };
    first.await.unwrap();
    second.await.unwrap();

    let show = harness.cache.show(&"foo".into()).await.unwrap();
    let selections: Vec<_> = show
        .episodes()
        .map(|e| e.selection_for(&user).unwrap().describe())
        .collect();
    assert!(selections.windows(2).all(|w| w[0] == w[1]), "{selections:?}");
    for episode in show.episodes() {
        let cached = episode.selection_for(&user).unwrap();
        let on_server = server.selection(&episode.id, &user).unwrap();
        assert_eq!(on_server.audio.as_ref(), Some(&cached.audio));
        assert_eq!(on_server.subtitle, cached.subtitle);
    }
}

fn observed_on(user: &UserId, show: &str, episode: u32, audio: &str) -> PropagationRequest {
    PropagationRequest {
        show_id: show.into(),
        user_id: user.clone(),
        source: PropagationSource::Observed {
            episode_id: episode_id(show, 1, episode),
            selection: TrackSelection::observed(audio, None, Utc::now()),
        },
        trigger: TriggerKind::PlayOrActivity,
    }
}

#[tokio::test]
async fn shutdown_mid_batch_stops_and_queues_a_retry() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[6]);
    let harness = Harness::new(server.clone(), config("show", "all")).await;
    let user = UserId::new("1");
    server.set_update_delay(Duration::from_millis(100));

    let running = {
        let engine = harness.engine.clone();
        let request = observed_on(&user, "foo", 1, "kor");
        tokio::spawn(async move { engine.execute(request).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    harness.shutdown.cancel();

    let execution = running.await.unwrap().unwrap();
    let Execution::Completed {
        targets, outcome, ..
    } = execution
    else {
        panic!("expected a completed propagation, got {execution:?}");
    };
    assert_eq!(targets, 5);
    assert!(outcome.cancelled);
    assert!(outcome.failures.is_empty());
    let calls = server.set_calls().len();
    assert!((1..targets).contains(&calls), "{calls} of {targets} targets updated");
    assert_eq!(outcome.changes.len(), calls);
    assert_eq!(
        harness.cache.propagation_retries(),
        vec![(ShowId::new("foo"), user.clone())]
    );
}

#[tokio::test]
async fn pauses_after_each_full_batch() {
    let server = FakeServer::new();
    server.add_show(LIBRARY, "foo", "Foo", &[], &[6]);
    let pause = Duration::from_millis(200);
    let harness = Harness::new(
        server.clone(),
        PropagationConfig {
            batch_size: 2,
            batch_pause_ms: 200,
            ..config("show", "all")
        },
    )
    .await;
    let user = UserId::new("1");

    let execution = harness
        .engine
        .execute(observed_on(&user, "foo", 1, "kor"))
        .await
        .unwrap();
    assert_eq!(execution.changes(), 5);

    let times = server.call_times();
    assert_eq!(times.len(), 5);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[1] >= pause, "no pause after the first batch: {gaps:?}");
    assert!(gaps[3] >= pause, "no pause after the second batch: {gaps:?}");
    assert!(gaps[0] < pause && gaps[2] < pause, "paused inside a batch: {gaps:?}");
}
