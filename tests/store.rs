use shmetrics::{LabelSet, MetricKind, MetricsError, MetricsStore, StoreConfig};

fn test_config(dir: &tempfile::TempDir) -> StoreConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    StoreConfig {
        path: dir.path().join("region"),
        region_size: 8 * 1024 * 1024,
        partitions: 32,
        ..Default::default()
    }
}

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    let mut set = LabelSet::new();
    for (k, v) in pairs {
        set.insert(*k, *v);
    }
    set
}

#[test]
fn counters_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    assert_eq!(store.increment_counter("requests", None).unwrap(), 1);
    assert_eq!(store.increment_counter("requests", None).unwrap(), 2);
    assert_eq!(
        store.increment_counter_by("requests", None, 10).unwrap(),
        12
    );

    let metrics = store.scan().unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].kind, MetricKind::Counter);
    assert_eq!(metrics[0].value, 12);
}

#[test]
fn gauges_set_and_adjust() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    assert_eq!(store.set_gauge("temp", None, 50).unwrap(), 50);
    assert_eq!(store.set_gauge("temp", None, -10).unwrap(), -10);
    assert_eq!(store.add_to_gauge("temp", None, 15).unwrap(), 5);
    assert_eq!(store.add_to_gauge("temp", None, -5).unwrap(), 0);

    // add_to_gauge on a fresh key starts from zero.
    assert_eq!(store.add_to_gauge("fresh", None, -7).unwrap(), -7);
}

#[test]
fn labels_distinguish_series() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let api = labels(&[("app", "api")]);
    let worker = labels(&[("app", "worker")]);

    store.increment_counter("jobs", Some(&api)).unwrap();
    store.increment_counter("jobs", Some(&api)).unwrap();
    store.increment_counter("jobs", Some(&worker)).unwrap();
    store.increment_counter("jobs", None).unwrap();

    let metrics = store.scan().unwrap();
    assert_eq!(metrics.len(), 3);

    let api_series = metrics
        .iter()
        .find(|m| m.labels.as_ref().is_some_and(|l| l == &api))
        .unwrap();
    assert_eq!(api_series.value, 2);

    let unlabeled = metrics.iter().find(|m| m.labels.is_none()).unwrap();
    assert_eq!(unlabeled.value, 1);
}

#[test]
fn label_insertion_order_is_irrelevant() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let ab = labels(&[("a", "1"), ("b", "2")]);
    let ba = labels(&[("b", "2"), ("a", "1")]);

    store.increment_counter("m", Some(&ab)).unwrap();
    assert_eq!(store.increment_counter("m", Some(&ba)).unwrap(), 2);
    assert_eq!(store.scan().unwrap().len(), 1);
}

#[test]
fn empty_labels_are_absent_labels() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let empty = LabelSet::new();
    store.increment_counter("m", Some(&empty)).unwrap();
    assert_eq!(store.increment_counter("m", None).unwrap(), 2);
}

#[test]
fn histogram_buckets_and_sum() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    // Under default variability 0.1, 98 and 100 share boundary 101.
    assert_eq!(store.record_histogram("latency", None, 98.0).unwrap(), 1);
    assert_eq!(store.record_histogram("latency", None, 100.0).unwrap(), 2);
    store.record_histogram("latency", None, 3.0).unwrap();

    let metrics = store.scan().unwrap();
    let bucket_101 = metrics
        .iter()
        .find(|m| m.kind == MetricKind::HistogramBucket && m.bucket == 101)
        .unwrap();
    assert_eq!(bucket_101.value, 2);

    let sum = metrics
        .iter()
        .find(|m| m.kind == MetricKind::HistogramSum)
        .unwrap();
    assert_eq!(sum.value, 98 + 100 + 3);
    assert_eq!(sum.bucket, 0);

    // 2 bucket entries plus the sum entry.
    assert_eq!(metrics.len(), 3);
}

#[test]
fn histogram_truncates_above_upper_bound() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let bounds = store.histogram_buckets();
    let top = *bounds.last().unwrap();

    store.record_histogram("big", None, 1e12).unwrap();
    let metrics = store.scan().unwrap();
    let bucket = metrics
        .iter()
        .find(|m| m.kind == MetricKind::HistogramBucket)
        .unwrap();
    assert_eq!(bucket.bucket, top, "clamped into the highest bucket");
}

#[test]
fn histogram_boundaries_enumeration() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let bounds = store.histogram_buckets();
    assert_eq!(bounds[0], 0);
    assert!(bounds.windows(2).all(|w| w[0] < w[1]));
    assert!(*bounds.last().unwrap() >= 30_000);
}

#[test]
fn delete_removes_all_kinds_for_a_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let tags = labels(&[("k", "v")]);
    store.record_histogram("lat", Some(&tags), 5.0).unwrap();
    store.record_histogram("lat", Some(&tags), 500.0).unwrap();
    store.increment_counter("lat", None).unwrap();

    // Two bucket entries + the sum entry match (name, labels); the
    // unlabeled counter does not.
    assert_eq!(store.delete("lat", Some(&tags)).unwrap(), 3);
    assert_eq!(store.delete("lat", Some(&tags)).unwrap(), 0);

    let metrics = store.scan().unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].kind, MetricKind::Counter);
}

#[test]
fn clear_empties_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    store.increment_counter("a", None).unwrap();
    store.set_gauge("b", None, 1).unwrap();
    store.record_histogram("c", None, 1.0).unwrap();

    assert_eq!(store.clear().unwrap(), 4);
    assert!(store.scan().unwrap().is_empty());
    assert!(store.is_empty());

    // Deleted space is recyclable.
    store.increment_counter("a", None).unwrap();
    assert_eq!(store.scan().unwrap().len(), 1);
}

#[test]
fn second_attachment_sees_and_updates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let writer = MetricsStore::open(&config).unwrap();
    let reader = MetricsStore::attach(&config).unwrap();

    let tags = labels(&[("zone", "eu")]);
    writer.increment_counter("seen", Some(&tags)).unwrap();

    let metrics = reader.scan().unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].value, 1);

    // Updates flow both directions through the same entry.
    assert_eq!(reader.increment_counter("seen", Some(&tags)).unwrap(), 2);
    assert_eq!(writer.increment_counter("seen", Some(&tags)).unwrap(), 3);
}

#[test]
fn state_survives_full_detach() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    {
        let store = MetricsStore::open(&config).unwrap();
        store.increment_counter_by("persisted", None, 41).unwrap();
    }
    // Every attachment is gone; the file still pins the region.

    let store = MetricsStore::attach(&config).unwrap();
    assert_eq!(store.increment_counter("persisted", None).unwrap(), 42);
}

#[test]
fn attacher_uses_creator_bucket_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let creator_config = StoreConfig {
        bucket_variability: 0.5,
        buckets_upper_bound: 1000,
        ..test_config(&dir)
    };

    let creator = MetricsStore::open(&creator_config).unwrap();

    // Attach with a deliberately different local config; the region's
    // parameters win.
    let attacher_config = StoreConfig {
        bucket_variability: 0.01,
        buckets_upper_bound: 9,
        ..test_config(&dir)
    };
    let attacher = MetricsStore::attach(&attacher_config).unwrap();

    assert_eq!(creator.histogram_buckets(), attacher.histogram_buckets());

    // gamma = 3: both processes bucket 2.0 to boundary 3.
    attacher.record_histogram("h", None, 2.0).unwrap();
    let metrics = creator.scan().unwrap();
    let bucket = metrics
        .iter()
        .find(|m| m.kind == MetricKind::HistogramBucket)
        .unwrap();
    assert_eq!(bucket.bucket, 3);
}

#[test]
fn region_size_is_fixed_by_the_creator() {
    let dir = tempfile::tempdir().unwrap();
    let small = StoreConfig {
        path: dir.path().join("region"),
        region_size: 1024 * 1024,
        partitions: 16,
        ..Default::default()
    };
    let big = StoreConfig {
        region_size: 8 * 1024 * 1024,
        ..small.clone()
    };

    let first = MetricsStore::open(&small).unwrap();
    let second = MetricsStore::open(&big).unwrap();

    // The larger local config must not extend the region: allocation
    // stops at the creator's size instead of handing out offsets the
    // first mapping cannot resolve.
    let mut inserted = 0usize;
    for i in 0..20_000 {
        match second.increment_counter(&format!("series_{i}"), None) {
            Ok(_) => inserted += 1,
            Err(MetricsError::OutOfSharedMemory) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(inserted > 0);
    assert!(inserted < 20_000, "1 MiB cannot hold 20k series");

    // Every entry the big-config handle created is visible through the
    // small mapping.
    let metrics = first.scan().unwrap();
    assert_eq!(metrics.len(), inserted);
}

#[test]
fn rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        partitions: 3,
        ..test_config(&dir)
    };
    assert!(matches!(
        MetricsStore::open(&config),
        Err(MetricsError::InvalidConfig(_))
    ));
}

#[test]
fn scan_decodes_structured_labels() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(&test_config(&dir)).unwrap();

    let set = LabelSet::from_value(serde_json::json!({
        "shard": 3,
        "primary": true,
        "host": "db-1"
    }))
    .unwrap();
    store.increment_counter("db_ops", Some(&set)).unwrap();

    let metrics = store.scan().unwrap();
    let decoded = metrics[0].labels.as_ref().unwrap();
    assert_eq!(decoded, &set);
    assert_eq!(decoded.get("shard"), Some(&serde_json::json!(3)));
}
