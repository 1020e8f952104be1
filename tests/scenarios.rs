//! End-to-end scenarios through the public API: commands with consistency
//! reservations, tenant isolation, and safe/unsafe projection reads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tagfold::{
    CommandContext, CommandMetadata, EventDraft, ExecuteError, MemoryEventStore, SafeWindowPolicy,
    SortableId, Tag, TagListProjection, TagProjector, TagStore, TagStoreBuilder, TenantId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum SeatEvent {
    FlightScheduled { seats: u32 },
    SeatBooked { passenger: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SeatCount {
    seats: u32,
    booked: u32,
}

struct FlightProjector;

impl TagProjector for FlightProjector {
    const NAME: &'static str = "FlightProjector";
    const VERSION: &'static str = "1";
    type State = SeatCount;

    fn project(state: SeatCount, event: &tagfold::Event) -> SeatCount {
        match EventDraft::decode_domain::<SeatEvent>(event) {
            Some(SeatEvent::FlightScheduled { seats }) => SeatCount { seats, booked: 0 },
            Some(SeatEvent::SeatBooked { .. }) => SeatCount {
                booked: state.booked + 1,
                ..state
            },
            None => state,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("flight {0} is fully booked")]
struct FullyBooked(String);

fn flight_tag(flight: &str) -> Tag {
    Tag::consistency("Flight", flight).expect("valid tag")
}

/// Opt-in log output for debugging: `RUST_LOG=tagfold=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Treats every event as settled the moment it lands.
struct SettleImmediately;

impl SafeWindowPolicy for SettleImmediately {
    fn threshold(&self, now: DateTime<Utc>) -> SortableId {
        SortableId::floor(now + chrono::Duration::days(1))
    }
}

async fn schedule_flight(store: &TagStore, flight: &str, seats: u32) {
    let ctx = store.context(CommandMetadata::default());
    ctx.append(&SeatEvent::FlightScheduled { seats }, vec![flight_tag(flight)])
        .await
        .expect("append");
    ctx.commit().await.expect("commit");
}

async fn book_seat(
    ctx: CommandContext,
    flight: &str,
    passenger: &str,
) -> Result<CommandContext, ExecuteError<FullyBooked>> {
    let tag = flight_tag(flight);
    let state = ctx.get_state::<FlightProjector>(&tag).await?;
    if state.payload.booked >= state.payload.seats {
        return Err(ExecuteError::Domain(FullyBooked(flight.to_string())));
    }
    ctx.append(
        &SeatEvent::SeatBooked {
            passenger: passenger.to_string(),
        },
        vec![tag],
    )
    .await?;
    Ok(ctx)
}

/// The canonical two-layer failure: with one seat left and two racing
/// bookings, the loser sees a concurrency conflict; retried against fresh
/// state, it becomes a business rejection.
#[tokio::test]
async fn losing_a_race_is_a_conflict_rebooking_a_full_flight_is_a_rejection() {
    init_tracing();
    let store = TagStoreBuilder::new().build().expect("build");
    schedule_flight(&store, "af-117", 1).await;

    // Both contexts observe one free seat.
    let ctx_a = store.context(CommandMetadata::default());
    let ctx_b = store.context(CommandMetadata::default());
    let ctx_a = book_seat(ctx_a, "af-117", "p-1").await.expect("a books");
    let ctx_b = book_seat(ctx_b, "af-117", "p-2").await.expect("b books");

    ctx_a.commit().await.expect("a commits first");
    let err = ctx_b.commit().await.expect_err("b is stale");
    assert!(err.is_conflict(), "the race loser sees a conflict: {err}");

    // Retried with fresh state, the flight is simply full.
    let err = store
        .execute(CommandMetadata::default(), |ctx| {
            book_seat(ctx, "af-117", "p-2")
        })
        .await
        .expect_err("no seats left");
    assert!(
        matches!(err, ExecuteError::Domain(FullyBooked(_))),
        "expected a business rejection, got: {err}"
    );
}

#[tokio::test]
async fn tenants_sharing_a_backend_never_see_each_other() {
    init_tracing();
    let backend = Arc::new(MemoryEventStore::new());
    let store_for = |tenant: &str| {
        TagStoreBuilder::new()
            .tenant(TenantId::new(tenant).expect("valid tenant"))
            .event_store(Arc::new(backend.scope(TenantId::new(tenant).expect("valid tenant"))))
            .build()
            .expect("build")
    };
    let airline_a = store_for("airline-a");
    let airline_b = store_for("airline-b");

    // The same tag string, two independent histories.
    schedule_flight(&airline_a, "af-117", 2).await;
    schedule_flight(&airline_b, "af-117", 9).await;
    store_b_book(&airline_b).await;

    let state_a = airline_a
        .state_cache()
        .get_state::<FlightProjector>(&flight_tag("af-117"))
        .await
        .expect("state a");
    let state_b = airline_b
        .state_cache()
        .get_state::<FlightProjector>(&flight_tag("af-117"))
        .await
        .expect("state b");

    assert_eq!(state_a.payload, SeatCount { seats: 2, booked: 0 });
    assert_eq!(state_b.payload, SeatCount { seats: 9, booked: 1 });
}

async fn store_b_book(store: &TagStore) {
    store
        .execute::<FullyBooked, _, _>(CommandMetadata::default(), |ctx| {
            book_seat(ctx, "af-117", "p-9")
        })
        .await
        .expect("booking succeeds");
}

#[tokio::test]
async fn list_projection_tracks_every_flight_and_safe_never_leads_latest() {
    init_tracing();
    let store = TagStoreBuilder::new()
        .safe_window(SettleImmediately)
        .multi_projection(TagListProjection::<FlightProjector>::new("Flight"))
        .build()
        .expect("build");

    schedule_flight(&store, "af-117", 2).await;
    schedule_flight(&store, "ba-204", 1).await;
    store
        .execute::<FullyBooked, _, _>(CommandMetadata::default(), |ctx| {
            book_seat(ctx, "af-117", "p-1")
        })
        .await
        .expect("booking succeeds");

    let states = store
        .projection::<TagListProjection<FlightProjector>>()
        .await
        .expect("projection");

    assert_eq!(states.latest.len(), 2);
    assert_eq!(
        states.latest.get("af-117").expect("af-117 tracked").payload,
        SeatCount { seats: 2, booked: 1 }
    );
    assert_eq!(
        states.latest.get("ba-204").expect("ba-204 tracked").payload,
        SeatCount { seats: 1, booked: 0 }
    );
    // With an always-settled window the folds agree exactly.
    assert_eq!(states.safe.len(), states.latest.len());
    assert_eq!(
        states.safe.get("af-117").expect("tracked").payload,
        states.latest.get("af-117").expect("tracked").payload
    );
}
