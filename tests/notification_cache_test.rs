use chrono::{TimeZone, Utc};
use notification_sync::notification_cache::{DuplicatePolicy, InsertOutcome, NotificationCache};
use notification_sync::types::Notification;

fn notification(id: &str, read: bool) -> Notification {
    Notification {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        title: format!("title {id}"),
        message: format!("message {id}"),
        read,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
    }
}

fn ids(cache: &NotificationCache) -> Vec<String> {
    cache.snapshot().notifications.into_iter().map(|n| n.id).collect()
}

#[test]
fn fetch_push_mark_read_scenario() {
    let cache = NotificationCache::new();

    cache.replace_all(vec![notification("1", false), notification("2", true)]);
    assert_eq!(cache.unread_count(), 1);

    assert_eq!(cache.insert_newest(notification("3", false)), InsertOutcome::Inserted);
    assert_eq!(ids(&cache), ["3", "1", "2"]);
    assert_eq!(cache.unread_count(), 2);

    assert!(cache.mark_read("1"));
    assert_eq!(cache.unread_count(), 1);
    assert!(!cache.mark_read("1"), "second mark_read is a no-op");
    assert_eq!(cache.unread_count(), 1);
}

#[test]
fn replace_all_discards_previous_contents() {
    let cache = NotificationCache::new();
    cache.replace_all(vec![
        notification("A", false),
        notification("B", false),
        notification("C", true),
    ]);

    cache.replace_all(vec![notification("D", true)]);

    assert_eq!(ids(&cache), ["D"]);
    assert_eq!(cache.unread_count(), 0);
}

#[test]
fn unknown_id_leaves_cache_untouched() {
    let cache = NotificationCache::new();
    cache.replace_all(vec![notification("1", false)]);
    let before = cache.snapshot();

    assert!(!cache.mark_read("missing"));

    assert_eq!(cache.snapshot(), before);
}

#[test]
fn redelivered_push_never_unreads_an_item() {
    let cache = NotificationCache::new();
    cache.replace_all(vec![notification("1", false), notification("2", false)]);
    cache.mark_read("2");

    assert_eq!(cache.insert_newest(notification("2", false)), InsertOutcome::Replaced);

    assert_eq!(ids(&cache), ["2", "1"]);
    assert_eq!(cache.get("2").map(|n| n.read), Some(true));
    assert_eq!(cache.unread_count(), 1);
}

#[test]
fn keep_both_policy_counts_each_copy() {
    let cache = NotificationCache::with_policy(DuplicatePolicy::KeepBoth);
    cache.insert_newest(notification("1", false));
    cache.insert_newest(notification("1", false));

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.unread_count(), 2);
}

#[test]
fn count_matches_contents_after_every_operation() {
    let cache = NotificationCache::new();
    let check = |cache: &NotificationCache| {
        let snapshot = cache.snapshot();
        let unread = snapshot.notifications.iter().filter(|n| !n.read).count();
        assert_eq!(snapshot.unread_count, unread);
    };

    cache.replace_all((0..10).map(|i| notification(&i.to_string(), i % 3 == 0)).collect());
    check(&cache);
    for i in 5..15 {
        cache.insert_newest(notification(&i.to_string(), false));
        check(&cache);
    }
    for i in (0..15).step_by(2) {
        cache.mark_read(&i.to_string());
        check(&cache);
    }
    cache.clear();
    check(&cache);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn concurrent_writers_keep_count_consistent() {
    let cache = std::sync::Arc::new(NotificationCache::new());
    let mut tasks = Vec::new();
    for worker in 0..8 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let id = format!("{worker}-{i}");
                cache.insert_newest(notification(&id, false));
                if i % 2 == 0 {
                    cache.mark_read(&id);
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(cache.len(), 400);
    assert_eq!(cache.unread_count(), 200);
}
