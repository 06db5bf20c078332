//! End-to-end offline scenario against the in-memory reference server.
//!
//! A tractor is created and updated while offline, a booking is queued and
//! an edit to a second tractor is set up to be rejected. Connectivity then
//! flaps at random before settling online, and the queue drains.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sync_engine::{
    Booking, BookingRepository, ConnectivityMonitor, EntityType, InMemoryRemote, LocalStore, ManualProbe,
    MutationQueue, StaticToken, SyncConfig, SyncEngine, SyncEvent, Tractor, TractorModel, TractorRepository,
};
use tracing::info;

const FLAPS: usize = 12;

pub async fn run(seed: Option<u64>) -> anyhow::Result<()> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let config = SyncConfig::default()
        .with_backoff(Duration::from_millis(50), Duration::from_millis(800))
        .with_stable_checks(2);
    let remote = Arc::new(InMemoryRemote::starting_at(42).with_latency(Duration::from_millis(5)));
    let queue = MutationQueue::new(LocalStore::volatile());
    let tractors = TractorRepository::new(queue.clone());
    let bookings = BookingRepository::new(queue.clone());

    // A tractor another device already registered.
    let existing = Tractor::new("coop-1", TractorModel::Mf375, "SN-0007", 880.0);
    remote.insert(EntityType::Tractor, "SRV-7", serde_json::to_value(&existing)?);
    queue.store().lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?
        .upsert_canonical(EntityType::Tractor, "SRV-7", "coop-1", serde_json::to_value(&existing)?)?;
    remote.reject_entity(EntityType::Tractor, "SRV-7", 409, "tractor is locked for inspection");

    let engine = Arc::new(SyncEngine::new(queue, remote.clone(), Arc::new(StaticToken::new("demo-token")), config.clone()));
    let monitor = Arc::new(ConnectivityMonitor::new(config.stable_checks));
    let probe = ManualProbe::new(false);
    let (handle, runner) = engine.clone().spawn(Some(monitor.subscribe()));
    let mut events = handle.subscribe();

    println!("== offline edits ==");
    let t1 = tractors.create(Tractor::new("coop-1", TractorModel::Mf240, "SN-0042", 100.0))?;
    let mut edited = t1.data.clone();
    edited.engine_hours = 120.0;
    tractors.update(&t1.id, edited)?;
    let mut locked = existing.clone();
    locked.current_status = "maintenance".to_string();
    tractors.update("SRV-7", locked)?;
    bookings.create(Booking {
        tractor_id: "SRV-7".to_string(),
        member_id: "member-3".to_string(),
        coop_id: "coop-1".to_string(),
        start_date: "2024-06-10".to_string(),
        end_date: "2024-06-12".to_string(),
        booking_status: "pending".to_string(),
        payment_status: "unpaid".to_string(),
        payment_amount_rwf: 45_000,
    })?;
    for item in handle.list_pending_mutations()? {
        println!("  #{:<3} {}", item.sequence_id, item.description);
    }

    println!("== connectivity flapping ==");
    for _ in 0..FLAPS {
        let reachable = rng.gen_bool(0.5);
        probe.set(reachable);
        remote.set_reachable(reachable);
        if let Some(event) = monitor.poll_once(&probe).await {
            println!("  {:?}", event);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    probe.set(true);
    remote.set_reachable(true);
    for _ in 0..config.stable_checks {
        if let Some(event) = monitor.poll_once(&probe).await {
            println!("  {:?}", event);
        }
    }

    let mut status = handle.status();
    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let current = status.borrow_and_update();
                if current.is_online && !current.is_syncing() && current.pending_count == 0 {
                    break;
                }
            }
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if settled.is_err() {
        bail!("queue did not drain within 10s");
    }

    println!("== sync events ==");
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::IdRemapped { entity_type, from, to } => println!("  remapped {} {} -> {}", entity_type, from, to),
            SyncEvent::DeadLettered { sequence_id, reason, .. } => println!("  #{} dead-lettered: {}", sequence_id, reason),
            SyncEvent::RunFinished(report) => println!(
                "  run ({:?}) -> {:?}: {} acked, {} dead-lettered",
                report.trigger, report.outcome, report.acked, report.dead_lettered
            ),
            _ => {}
        }
    }

    println!("== result ==");
    let server_copy = remote.get(EntityType::Tractor, "SRV-42").context("SRV-42 missing on server")?;
    println!("  server SRV-42 engine_hours = {}", server_copy["engine_hours"]);
    if let Some(local) = tractors.get_by_id("SRV-42")? {
        println!("  local  SRV-42 engine_hours = {} synced = {}", local.data.engine_hours, local.synced);
    }
    for item in handle.list_dead_letters()? {
        println!(
            "  needs review: #{} {} ({})",
            item.sequence_id,
            item.description,
            item.last_error.unwrap_or_default()
        );
    }
    info!(cursor = ?engine.cursor()?, "demo finished");

    handle.shutdown();
    runner.await?;
    Ok(())
}
