//! End-to-end behaviour of the engine across page loads sharing one store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use abtrack_cache::LocalStore;
use abtrack_core::config::EngineConfig;
use abtrack_core::event_bus::CaptureSink;
use abtrack_core::store::{RecordStore, StoreKeys};
use abtrack_core::types::{
    AssignmentRecord, AudienceContext, Destination, DeviceClass, Experiment, ExperimentKind,
    ExperimentStatus, FullPageLayout, PageContext, ReportEventType, Trigger,
};
use abtrack_engine::conversion::{self, Transition};
use abtrack_engine::resolver;
use abtrack_engine::timers::TimerKey;
use abtrack_engine::{
    ActivitySignal, AssignmentStatus, Engine, EngineContext, Presentation, StaticContent,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn on_page(id: &str, variations: &[&str]) -> Experiment {
    Experiment {
        id: id.into(),
        kind: ExperimentKind::OnPage,
        variation_ids: variations.iter().map(|v| v.to_string()).collect(),
        variant_count: None,
        full_page: None,
        winner: None,
        status: ExperimentStatus::Published,
        tracking_enabled: true,
        target_percentage: 100,
        audience: None,
        conversion: Trigger::ExternalEvent {
            name: "purchase".into(),
        },
        goals: vec![],
    }
}

fn audience(url: &str) -> AudienceContext {
    AudienceContext {
        url: url.into(),
        device: DeviceClass::Desktop,
        is_local_dev: false,
    }
}

fn page_engine(
    store: &Arc<LocalStore>,
    sink: &Arc<CaptureSink>,
    page_id: &str,
    experiments: Vec<Experiment>,
    seed: u64,
) -> Engine {
    let url = format!("https://shop.test/{page_id}");
    Engine::new(
        EngineConfig::default(),
        store.clone(),
        sink.clone(),
        PageContext {
            page_id: page_id.into(),
            url: url.clone(),
        },
        audience(&url),
        experiments,
    )
    .with_rng(StdRng::seed_from_u64(seed))
}

fn bare_context(store: Arc<LocalStore>, sink: Arc<CaptureSink>, seed: u64) -> EngineContext {
    let mut ctx = EngineContext::new(
        EngineConfig::default(),
        store,
        sink,
        PageContext {
            page_id: "home".into(),
            url: "https://shop.test/".into(),
        },
        audience("https://shop.test/"),
    );
    ctx.rng = StdRng::seed_from_u64(seed);
    ctx
}

#[test]
fn resolution_is_sticky_across_page_loads() {
    let sink = Arc::new(CaptureSink::new());
    let exp = on_page("hero", &["a", "b", "c", "d"]);

    for seed in 0..20 {
        let store = Arc::new(LocalStore::new(100));
        let first = page_engine(&store, &sink, "home", vec![exp.clone()], seed).load_page(&["hero"]);
        // A different seed would roll differently if the record were ignored.
        let second =
            page_engine(&store, &sink, "home", vec![exp.clone()], seed + 1000).load_page(&["hero"]);
        assert_eq!(first[0].status, AssignmentStatus::New);
        assert_eq!(second[0].status, AssignmentStatus::Returning);
        assert_eq!(first[0].presentation, second[0].presentation);
    }
}

#[test]
fn sampling_is_uniform_across_variations() {
    let store = Arc::new(LocalStore::new(100));
    let mut ctx = bare_context(store, Arc::new(CaptureSink::new()), 2024);
    let exp = on_page("grid", &["a", "b", "c", "d"]);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..10_000 {
        let resolution = resolver::resolve(&mut ctx, &exp);
        assert!(resolution.is_new_assignment);
        let variation = resolution.variation_id.expect("variation");
        *counts.entry(variation).or_default() += 1;
        ctx.discard_record("grid");
    }

    assert_eq!(counts.len(), 4);
    for (variation, count) in counts {
        assert!(
            (2375..=2625).contains(&count),
            "variation {variation} got {count} of 10000"
        );
    }
}

#[test]
fn zero_target_percentage_skips_everyone() {
    let mut exp = on_page("gate", &["control", "b"]);
    exp.target_percentage = 0;
    let keys = StoreKeys::default();

    for seed in 0..200 {
        let store = Arc::new(LocalStore::new(100));
        let mut ctx = bare_context(store.clone(), Arc::new(CaptureSink::new()), seed);
        let resolution = resolver::resolve(&mut ctx, &exp);
        assert!(resolution.skipped);
        assert_eq!(resolution.variation_id.as_deref(), Some("control"));

        let raw = store.get(&keys.assignment("gate")).unwrap().expect("skip record");
        let record: AssignmentRecord = serde_json::from_str(&raw).unwrap();
        assert!(record.skipped);
    }
}

#[test]
fn winner_overrides_existing_assignment() {
    let store = Arc::new(LocalStore::new(100));
    let sink = Arc::new(CaptureSink::new());
    let mut ctx = bare_context(store.clone(), sink, 1);
    ctx.write_record(&AssignmentRecord::assigned("promo", "a"));

    let mut exp = on_page("promo", &["a", "b"]);
    exp.winner = Some("b".into());
    for _ in 0..10 {
        let resolution = resolver::resolve(&mut ctx, &exp);
        assert_eq!(resolution.variation_id.as_deref(), Some("b"));
        assert!(!resolution.is_new_assignment);
        assert!(!resolution.skipped);
    }
    // The old record is left untouched; no sampling wrote over it.
    let raw = store.get(&StoreKeys::default().assignment("promo")).unwrap().unwrap();
    let record: AssignmentRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(record.variation_id, "a");
}

#[test]
fn conversion_is_terminal_for_goals() {
    let store = Arc::new(LocalStore::new(100));
    let sink = Arc::new(CaptureSink::new());
    let mut ctx = bare_context(store, sink.clone(), 1);
    ctx.write_record(&AssignmentRecord::assigned("checkout", "b"));

    assert_eq!(conversion::convert(&mut ctx, "checkout", 1.0), Transition::Applied);
    assert_eq!(
        conversion::complete_goal(&mut ctx, "checkout", 1),
        Transition::AlreadyConverted
    );

    let engine_view = match ctx.read_record("checkout") {
        abtrack_engine::context::RecordRead::Found(record) => record,
        other => panic!("unexpected read {other:?}"),
    };
    assert!(engine_view.converted);
    assert!(engine_view.goals_completed.is_empty());
    assert_eq!(sink.count(), 1);
}

#[test]
fn elapsed_time_fires_exactly_once_at_fifth_active_tick() {
    let store = Arc::new(LocalStore::new(100));
    let sink = Arc::new(CaptureSink::new());
    let mut exp = on_page("timed", &["a", "b"]);
    exp.conversion = Trigger::ElapsedTime { seconds: 5 };

    let mut engine = page_engine(&store, &sink, "home", vec![exp], 3);
    engine.load_page(&["timed"]);
    let key = TimerKey::Conversion("timed".into());
    assert_eq!(engine.context().timers.get(&key), Some(5));

    let content = StaticContent::default();
    let start = Instant::now();
    let mut fired_at = Vec::new();
    for tick in 1..=8u64 {
        let now = start + std::time::Duration::from_secs(tick);
        engine.signal(ActivitySignal::Key, now);
        if !engine.tick(now, &content).is_empty() {
            fired_at.push(tick);
        }
    }

    assert_eq!(fired_at, vec![5]);
    assert_eq!(sink.count_type(ReportEventType::Conversion), 1);
    assert_eq!(engine.context().timers.get(&key), Some(-1));
}

#[test]
fn countdown_resumes_after_reload() {
    let store = Arc::new(LocalStore::new(100));
    let sink = Arc::new(CaptureSink::new());
    let mut exp = on_page("timed", &["a"]);
    exp.conversion = Trigger::ElapsedTime { seconds: 4 };
    let content = StaticContent::default();
    let start = Instant::now();

    let mut first = page_engine(&store, &sink, "home", vec![exp.clone()], 1);
    first.load_page(&["timed"]);
    for tick in 1..=3u64 {
        let now = start + std::time::Duration::from_secs(tick);
        first.signal(ActivitySignal::Press, now);
        first.tick(now, &content);
    }

    let mut reloaded = page_engine(&store, &sink, "home", vec![exp], 2);
    reloaded.load_page(&["timed"]);
    let key = TimerKey::Conversion("timed".into());
    assert_eq!(reloaded.context().timers.get(&key), Some(1));

    let now = start + std::time::Duration::from_secs(10);
    reloaded.signal(ActivitySignal::Touch, now);
    assert_eq!(reloaded.tick(now, &content).len(), 1);
    assert!(reloaded.record("timed").unwrap().converted);
}

#[test]
fn redirect_hands_visit_across_navigation_exactly_once() {
    let store = Arc::new(LocalStore::new(100));
    let sink = Arc::new(CaptureSink::new());
    let exp = Experiment {
        id: "landing".into(),
        kind: ExperimentKind::FullPage,
        variation_ids: vec![],
        variant_count: None,
        full_page: Some(FullPageLayout {
            origin_page: "home".into(),
            destinations: vec![Destination {
                variation_id: "alt".into(),
                url: "https://shop.test/alt".into(),
            }],
        }),
        winner: None,
        status: ExperimentStatus::Published,
        tracking_enabled: true,
        target_percentage: 100,
        audience: None,
        conversion: Trigger::StaticPageMatch {
            page_id: "thanks".into(),
        },
        goals: vec![],
    };
    let keys = StoreKeys::default();
    // Pin the assignment so the redirect path is always taken.
    let ctx = bare_context(store.clone(), sink.clone(), 1);
    ctx.write_record(&AssignmentRecord::assigned("landing", "alt"));
    drop(ctx);

    let outcomes = page_engine(&store, &sink, "home", vec![exp.clone()], 1).load_page(&["landing"]);
    assert!(matches!(
        &outcomes[0].presentation,
        Presentation::Navigate { url, .. } if url == "https://shop.test/alt"
    ));
    assert!(store.get(&keys.pending_visit()).unwrap().is_some());
    assert_eq!(sink.count(), 0);

    page_engine(&store, &sink, "alt", vec![exp.clone()], 1).load_page(&[]);
    assert_eq!(sink.count_type(ReportEventType::Visit), 1);
    let visit = &sink.events()[0];
    assert_eq!(visit.variation_id, "alt");
    assert_eq!(visit.destination_url.as_deref(), Some("https://shop.test/alt"));
    assert!(store.get(&keys.pending_visit()).unwrap().is_none());

    // A second consumption finds nothing.
    page_engine(&store, &sink, "alt", vec![exp], 1).load_page(&[]);
    assert_eq!(sink.count_type(ReportEventType::Visit), 1);
}

#[test]
fn navigation_stops_processing_later_experiments() {
    let store = Arc::new(LocalStore::new(100));
    let sink = Arc::new(CaptureSink::new());
    let redirect = Experiment {
        id: "landing".into(),
        kind: ExperimentKind::FullPage,
        variation_ids: vec![],
        variant_count: None,
        full_page: Some(FullPageLayout {
            origin_page: "home".into(),
            destinations: vec![Destination {
                variation_id: "alt".into(),
                url: "https://shop.test/alt".into(),
            }],
        }),
        winner: Some("alt".into()),
        status: ExperimentStatus::Published,
        tracking_enabled: true,
        target_percentage: 100,
        audience: None,
        conversion: Trigger::StaticPageMatch {
            page_id: "thanks".into(),
        },
        goals: vec![],
    };
    let later = on_page("hero", &["a", "b"]);

    let outcomes =
        page_engine(&store, &sink, "home", vec![redirect, later], 1).load_page(&["landing", "hero"]);
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_navigation());
    // Winner redirects are untracked: no pending visit, no records.
    assert!(store.is_empty());
}
