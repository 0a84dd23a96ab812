//! Service-level invariants: creation rate bound, store capacity, toast
//! visibility.

use std::sync::Arc;
use towncrier::{
    reserved, ListFilter, Notification, NotificationPriority, NotificationService,
    NotificationType, ServiceConfig, ServiceError,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_stay_within_the_rate_bound() {
    let service = NotificationService::new(ServiceConfig {
        rate_limit_max_events: 100,
        max_notifications: 500,
        ..Default::default()
    })
    .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            let mut accepted = 0usize;
            for _ in 0..20 {
                if service
                    .create(NotificationType::Info, NotificationPriority::Low, "t", "m")
                    .is_ok()
                {
                    accepted += 1;
                }
            }
            accepted
        }));
    }

    let mut accepted = 0usize;
    for task in tasks {
        accepted += task.await.unwrap();
    }

    // 200 attempts against a window of 100: exactly the bound is admitted.
    assert_eq!(accepted, 100);
    assert_eq!(service.list(&ListFilter::default()).len(), 100);
}

#[tokio::test]
async fn store_capacity_bounds_the_backlog() {
    let service = NotificationService::new(ServiceConfig {
        max_notifications: 50,
        rate_limit_max_events: 1000,
        ..Default::default()
    })
    .unwrap();

    for i in 0..80 {
        service
            .create(
                NotificationType::Info,
                NotificationPriority::Low,
                format!("n{i}"),
                "m",
            )
            .unwrap();
    }

    let listed = service.list(&ListFilter::default());
    assert_eq!(listed.len(), 50);
    // Newest first, and the newest creation survived the evictions.
    assert_eq!(listed[0].title, "n79");
}

#[tokio::test]
async fn denied_creations_leave_no_trace() {
    let service = NotificationService::new(ServiceConfig {
        rate_limit_max_events: 1,
        ..Default::default()
    })
    .unwrap();
    let mut sub = service.subscribe();

    service
        .create(NotificationType::Info, NotificationPriority::Low, "kept", "m")
        .unwrap();
    let denied =
        service.create(NotificationType::Info, NotificationPriority::Low, "denied", "m");
    assert_eq!(denied.unwrap_err(), ServiceError::RateLimited);

    // Only the admitted notification was stored or broadcast.
    assert_eq!(service.list(&ListFilter::default()).len(), 1);
    assert_eq!(sub.receiver.recv().await.unwrap().title, "kept");
    assert!(sub.receiver.try_recv().is_err());
}

#[tokio::test]
async fn toasts_reach_subscribers_but_never_queries() {
    let service = NotificationService::new(ServiceConfig::default()).unwrap();
    let mut sub = service.subscribe();

    let toast = Notification::new(
        NotificationType::Info,
        NotificationPriority::Low,
        "transient",
        "m",
    )
    .with_metadata(reserved::IS_TOAST, true)
    .with_metadata(reserved::TOAST_TYPE, "success");
    service.create_with_metadata(toast.clone()).unwrap();
    service
        .create(NotificationType::Info, NotificationPriority::Low, "durable", "m")
        .unwrap();

    // Both were offered to the subscriber, in creation order.
    assert_eq!(sub.receiver.recv().await.unwrap().id, toast.id);
    assert_eq!(sub.receiver.recv().await.unwrap().title, "durable");

    // Queries and unread counts never see the toast.
    let listed = service.list(&ListFilter::default());
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "durable");
    assert_eq!(service.unread_count(), 1);
}
