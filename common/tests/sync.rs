use std::sync::Arc;
use std::time::Duration;

use fog_common::{
    BroadcastOutcome, FogPayload, FogStore, FogSyncData, FogSyncService, Hub, Identity, LosBlocker,
    MapBounds, SyncEvent, SyncOptions, VisionSource, SCHEMA_VERSION, VISIBLE,
};

fn unthrottled(hub: &Arc<Hub>) -> FogSyncService {
    FogSyncService::with_options(
        hub.clone(),
        SyncOptions {
            min_interval: Duration::ZERO,
            ..SyncOptions::default()
        },
    )
}

async fn next_fog(service: &mut FogSyncService) -> FogSyncData {
    loop {
        match service.recv().await {
            Some(SyncEvent::FogUpdate(data)) => return data,
            Some(_) => continue,
            None => panic!("disconnected"),
        }
    }
}

fn snapshot_update(store: &FogStore, at: u64, by: &str) -> FogSyncData {
    FogSyncData {
        schema: SCHEMA_VERSION,
        session_id: "table".into(),
        map_id: store.map_id().into(),
        payload: FogPayload::Snapshot {
            snapshot: store.snapshot(),
        },
        fog_settings: store.settings().clone(),
        last_updated: at,
        updated_by: by.into(),
    }
}

#[tokio::test]
async fn token_vision_reaches_every_player() {
    let hub = Arc::new(Hub::new(64));
    let mut gm = unthrottled(&hub);
    gm.initialize("table", Some(Identity::new("gm", true)));

    let mut players: Vec<(FogSyncService, FogStore)> = (0..3)
        .map(|i| {
            let mut service = unthrottled(&hub);
            service.initialize("table", Some(Identity::new(format!("p{i}"), false)));
            let store = FogStore::new("dungeon", MapBounds::new(-10.0, -10.0, 20.0, 20.0), 1.0);
            (service, store)
        })
        .collect();

    let mut gm_store = FogStore::new("dungeon", MapBounds::new(-10.0, -10.0, 20.0, 20.0), 1.0);
    gm_store.set_blockers(vec![LosBlocker::rect(2.0, -10.0, 1.0, 20.0)]);
    gm_store.set_sources(vec![VisionSource::new(0.5, 0.5, 5.0)]);
    gm_store.recompute();
    gm_store.reveal_rect(-10.0, -10.0, 2.0, 2.0);
    assert_eq!(gm.broadcast_fog_update(&gm_store), BroadcastOutcome::Sent);

    for (service, store) in players.iter_mut() {
        let data = next_fog(service).await;
        assert!(store.apply_remote(&data).unwrap());
        assert_eq!(store.raw(), gm_store.raw());
    }

    // Grid-local x 14 lies past the wall.
    let (col, row) = gm_store.grid().world_to_cell(14.5, 10.5).unwrap();
    assert_ne!(gm_store.grid().get(col, row).as_u8(), VISIBLE);
}

#[tokio::test]
async fn out_of_order_delivery_keeps_the_newest_state() {
    let bounds = MapBounds::from_size(4.0, 4.0);
    let mut first = FogStore::new("m", bounds, 1.0);
    first.reveal_rect(0.0, 0.0, 2.0, 2.0);
    let t1 = snapshot_update(&first, 1_000, "gm");

    let mut second = FogStore::new("m", bounds, 1.0);
    second.reveal_all();
    let t2 = snapshot_update(&second, 2_000, "gm");

    let mut in_order = FogStore::new("m", bounds, 1.0);
    in_order.apply_remote(&t1).unwrap();
    in_order.apply_remote(&t2).unwrap();

    let mut reversed = FogStore::new("m", bounds, 1.0);
    assert!(reversed.apply_remote(&t2).unwrap());
    assert!(!reversed.apply_remote(&t1).unwrap());

    assert_eq!(in_order.raw(), reversed.raw());
    assert_eq!(reversed.raw(), second.raw());
}

#[tokio::test]
async fn player_joining_late_sees_existing_peers() {
    let hub = Arc::new(Hub::new(16));
    let mut gm = unthrottled(&hub);
    gm.initialize("table", Some(Identity::new("gm", true)));

    let mut late = unthrottled(&hub);
    late.initialize("table", Some(Identity::new("late", false)));
    let peers = late.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].user_id, "gm");

    match gm.recv().await {
        Some(SyncEvent::PeerJoined(p)) => assert_eq!(p.user_id, "late"),
        unexpected => panic!("unexpected {unexpected:?}"),
    }
}

#[tokio::test]
async fn late_joiner_converges_with_the_gm() {
    let hub = Arc::new(Hub::new(64));
    let bounds = MapBounds::from_size(10.0, 10.0);
    let mut gm = unthrottled(&hub);
    gm.initialize("table", Some(Identity::new("gm", true)));
    let mut gm_store = FogStore::new("dungeon", bounds, 1.0);
    gm_store.reveal_rect(0.0, 0.0, 5.0, 5.0);
    assert_eq!(gm.broadcast_fog_update(&gm_store), BroadcastOutcome::Sent);

    let mut late = unthrottled(&hub);
    late.initialize("table", Some(Identity::new("late", false)));
    let mut late_store = FogStore::new("dungeon", bounds, 1.0);
    assert!(matches!(gm.recv().await, Some(SyncEvent::PeerJoined(_))));

    gm_store.reveal_rect(7.0, 7.0, 1.0, 1.0);
    assert_eq!(gm.broadcast_fog_update(&gm_store), BroadcastOutcome::Sent);
    let data = next_fog(&mut late).await;
    assert!(late_store.apply_remote(&data).unwrap());
    assert_eq!(late_store.raw(), gm_store.raw());

    // Later paints go out as deltas on top of that snapshot.
    gm_store.reveal_rect(9.0, 0.0, 1.0, 1.0);
    gm.broadcast_fog_update(&gm_store);
    let data = next_fog(&mut late).await;
    assert!(!data.payload.is_snapshot());
    assert!(late_store.apply_remote(&data).unwrap());
    assert_eq!(late_store.raw(), gm_store.raw());
}

#[tokio::test]
async fn silent_listener_recovers_from_a_missed_base() {
    let hub = Arc::new(Hub::new(64));
    let bounds = MapBounds::from_size(8.0, 8.0);
    let mut gm = unthrottled(&hub);
    gm.initialize("table", Some(Identity::new("gm", true)));
    let mut gm_store = FogStore::new("dungeon", bounds, 1.0);
    gm_store.reveal_rect(0.0, 0.0, 4.0, 4.0);
    gm.broadcast_fog_update(&gm_store);

    let mut listener = FogSyncService::with_options(
        hub.clone(),
        SyncOptions {
            min_interval: Duration::ZERO,
            track_presence: false,
            ..SyncOptions::default()
        },
    );
    listener.initialize("table", Some(Identity::new("recorder", false)));
    let mut mirror = FogStore::new("dungeon", bounds, 1.0);

    gm_store.reveal_rect(6.0, 6.0, 1.0, 1.0);
    gm.broadcast_fog_update(&gm_store);
    assert!(tokio::time::timeout(Duration::from_millis(50), listener.recv())
        .await
        .is_err());

    match gm.recv().await {
        Some(SyncEvent::ResyncRequested { map_id }) => {
            assert_eq!(map_id.as_deref(), Some("dungeon"))
        }
        unexpected => panic!("unexpected {unexpected:?}"),
    }
    gm.broadcast_fog_update(&gm_store);
    let data = next_fog(&mut listener).await;
    assert!(mirror.apply_remote(&data).unwrap());
    assert_eq!(mirror.raw(), gm_store.raw());
}
