use super::*;

fn key(id: &str) -> EventId {
    EventId::new(id)
}

#[test]
fn second_delivery_within_window_is_duplicate() {
    let mut dedup = Deduplicator::new(Duration::from_secs(10));
    let start = Instant::now();

    assert_eq!(dedup.seen_at(&key("m-100"), start), Admission::Fresh);
    assert_eq!(
        dedup.seen_at(&key("m-100"), start + Duration::from_secs(2)),
        Admission::Duplicate
    );
    assert_eq!(dedup.len(), 1);
}

#[test]
fn distinct_keys_are_independent() {
    let mut dedup = Deduplicator::new(Duration::from_secs(10));
    let now = Instant::now();
    assert_eq!(dedup.seen_at(&key("a"), now), Admission::Fresh);
    assert_eq!(dedup.seen_at(&key("b"), now), Admission::Fresh);
    assert_eq!(dedup.len(), 2);
}

#[test]
fn key_is_admitted_again_after_window_elapses() {
    let mut dedup = Deduplicator::new(Duration::from_secs(10));
    let start = Instant::now();

    assert_eq!(dedup.seen_at(&key("m-1"), start), Admission::Fresh);
    assert_eq!(
        dedup.seen_at(&key("m-1"), start + Duration::from_secs(10)),
        Admission::Fresh
    );
}

#[test]
fn duplicate_does_not_extend_retention() {
    let mut dedup = Deduplicator::new(Duration::from_secs(10));
    let start = Instant::now();

    dedup.seen_at(&key("m-1"), start);
    assert_eq!(
        dedup.seen_at(&key("m-1"), start + Duration::from_secs(9)),
        Admission::Duplicate
    );
    assert_eq!(
        dedup.seen_at(&key("m-1"), start + Duration::from_secs(11)),
        Admission::Fresh
    );
}

#[test]
fn expired_entries_are_swept_lazily() {
    let mut dedup = Deduplicator::new(Duration::from_secs(10));
    let start = Instant::now();

    for index in 0..50 {
        dedup.seen_at(&key(&format!("old-{index}")), start);
    }
    assert_eq!(dedup.len(), 50);

    dedup.seen_at(&key("new"), start + Duration::from_secs(30));
    assert_eq!(dedup.len(), 1);
}
