//! Notification enqueue, dispatch, retry and recipient-side transitions
//! against the in-memory store.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;
use beacon_core::error::CoreError;
use beacon_core::notification::{
    Channel, Notification, NotificationStatus, PRIORITY_LOW, PRIORITY_URGENT,
};
use beacon_core::settings::CreateSetting;
use beacon_core::template::CreateTemplate;
use beacon_events::bus::{NOTIFICATION_ENQUEUED, NOTIFICATION_FAILED, NOTIFICATION_SENT};
use beacon_events::{Content, Engine, EngineConfig, EngineError, NotificationRequest, Transition};
use common::{all_notifications, engine, engine_with, minutes, t0, ScriptedSender, TENANT};

fn request(recipients: Vec<i64>, channels: Vec<Channel>) -> NotificationRequest {
    NotificationRequest::new(
        "PAYMENT_DUE",
        recipients,
        channels,
        Content::literal("Rent due", "Rent for March is due on Friday"),
    )
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Two recipients over email and SMS give four independent rows.
#[tokio::test]
async fn one_row_per_recipient_and_channel() {
    let email = ScriptedSender::ok(Channel::Email);
    let sms = ScriptedSender::failing(Channel::Sms);
    let engine = engine(&[email.clone(), sms.clone()]);

    let ids = engine
        .notifications
        .send_notification(TENANT, &request(vec![1, 2], vec![Channel::Email, Channel::Sms]), t0())
        .await
        .unwrap();
    assert_eq!(ids.len(), 4);

    let rows = all_notifications(&engine).await;
    assert_eq!(rows.len(), 4);
    for n in &rows {
        match n.channel {
            Channel::Email => {
                assert_eq!(n.status, NotificationStatus::Sent);
                assert_eq!(n.sent_at, Some(t0()));
                assert_eq!(n.retry_count, 0);
            }
            Channel::Sms => {
                assert_eq!(n.status, NotificationStatus::Failed);
                assert_eq!(n.retry_count, 1);
                assert_eq!(
                    n.error_message.as_deref(),
                    Some("Rejected by provider: gateway said no")
                );
            }
            other => panic!("unexpected channel {other}"),
        }
    }
    assert_eq!(email.calls(), 2);
    assert_eq!(sms.calls(), 2);
}

#[tokio::test]
async fn duplicate_recipients_and_channels_collapse() {
    let engine = engine(&[ScriptedSender::ok(Channel::Email)]);
    let ids = engine
        .notifications
        .send_notification(
            TENANT,
            &request(vec![1, 1, 2], vec![Channel::Email, Channel::Email]),
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let engine = engine(&[]);
    let empty = request(vec![], vec![Channel::Email]);
    let err = engine.notifications.send_notification(TENANT, &empty, t0()).await.unwrap_err();
    assert_matches!(err, EngineError::Core(CoreError::Validation(_)));

    let bad_priority = request(vec![1], vec![Channel::Email]).priority(9);
    let err = engine
        .notifications
        .send_notification(TENANT, &bad_priority, t0())
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Core(CoreError::Validation(_)));
    assert!(all_notifications(&engine).await.is_empty());
}

#[tokio::test]
async fn unconfigured_channel_fails_with_a_recorded_error() {
    let engine = engine(&[]);
    engine
        .notifications
        .send_notification(TENANT, &request(vec![1], vec![Channel::Sms]), t0())
        .await
        .unwrap();

    let rows = all_notifications(&engine).await;
    assert_eq!(rows[0].status, NotificationStatus::Failed);
    assert_eq!(
        rows[0].error_message.as_deref(),
        Some("No sender configured for channel SMS")
    );
}

#[tokio::test]
async fn delivery_outcomes_reach_the_bus() {
    let engine = engine(&[ScriptedSender::ok(Channel::Email), ScriptedSender::failing(Channel::Sms)]);
    let mut events = engine.bus.subscribe();
    engine
        .notifications
        .send_notification(TENANT, &request(vec![1], vec![Channel::Email, Channel::Sms]), t0())
        .await
        .unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.tenant_id, Some(TENANT));
        *counts.entry(event.event_type).or_default() += 1;
    }
    assert_eq!(counts.get(NOTIFICATION_ENQUEUED), Some(&2));
    assert_eq!(counts.get(NOTIFICATION_SENT), Some(&1));
    assert_eq!(counts.get(NOTIFICATION_FAILED), Some(&1));
}

// ---------------------------------------------------------------------------
// Scheduling and expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn future_rows_wait_for_their_schedule() {
    let email = ScriptedSender::ok(Channel::Email);
    let engine = engine(&[email.clone()]);
    let later = request(vec![1], vec![Channel::Email]).scheduled_at(minutes(60));
    engine.notifications.send_notification(TENANT, &later, t0()).await.unwrap();

    let early = engine.notifications.dispatch_due(minutes(59)).await.unwrap();
    assert_eq!(early.claimed, 0);
    assert_eq!(email.calls(), 0);
    assert_eq!(all_notifications(&engine).await[0].status, NotificationStatus::Pending);

    let on_time = engine.notifications.dispatch_due(minutes(60)).await.unwrap();
    assert_eq!(on_time.sent, 1);
    assert_eq!(email.calls(), 1);
}

#[tokio::test]
async fn expired_rows_are_never_sent() {
    let email = ScriptedSender::ok(Channel::Email);
    let engine = engine(&[email.clone()]);
    let short_lived = request(vec![1], vec![Channel::Email])
        .scheduled_at(minutes(20))
        .expires_at(minutes(10));
    engine.notifications.enqueue(TENANT, &short_lived, t0()).await.unwrap();

    let report = engine.notifications.dispatch_due(minutes(30)).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(email.calls(), 0);
    assert_eq!(all_notifications(&engine).await[0].status, NotificationStatus::Expired);
}

#[tokio::test]
async fn expire_stale_leaves_live_rows_alone() {
    let engine = engine(&[]);
    let stale = request(vec![1], vec![Channel::Email])
        .scheduled_at(minutes(30))
        .expires_at(minutes(5));
    let live = request(vec![2], vec![Channel::Email])
        .scheduled_at(minutes(30))
        .expires_at(minutes(90));
    engine.notifications.enqueue(TENANT, &stale, t0()).await.unwrap();
    engine.notifications.enqueue(TENANT, &live, t0()).await.unwrap();

    assert_eq!(engine.notifications.expire_stale(minutes(10)).await.unwrap(), 1);
    let statuses: Vec<_> = all_notifications(&engine)
        .await
        .into_iter()
        .map(|n| (n.recipient_id, n.status))
        .collect();
    assert!(statuses.contains(&(1, NotificationStatus::Expired)));
    assert!(statuses.contains(&(2, NotificationStatus::Pending)));
}

#[tokio::test]
async fn dispatch_takes_the_most_urgent_first() {
    let email = ScriptedSender::ok(Channel::Email);
    let config = EngineConfig {
        dispatch_batch_size: 1,
        ..Default::default()
    };
    let engine = engine_with(config, &[email.clone()]);
    let routine = request(vec![1], vec![Channel::Email]).priority(PRIORITY_LOW);
    let urgent = request(vec![2], vec![Channel::Email]).priority(PRIORITY_URGENT);
    engine.notifications.enqueue(TENANT, &routine, t0()).await.unwrap();
    let urgent_ids = engine.notifications.enqueue(TENANT, &urgent, t0()).await.unwrap();

    let report = engine.notifications.dispatch_due(t0()).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(email.sent(), vec![urgent_ids[0].id]);
}

#[tokio::test]
async fn urgent_alerts_ignore_the_schedule() {
    let push = ScriptedSender::ok(Channel::Push);
    let engine = engine(&[push.clone()]);
    let later = request(vec![1], vec![Channel::Push]).scheduled_at(minutes(120));

    engine.notifications.send_urgent_alert(TENANT, &later, t0()).await.unwrap();
    let rows = all_notifications(&engine).await;
    let row = &rows[0];
    assert_eq!(row.priority_level, PRIORITY_URGENT);
    assert_eq!(row.scheduled_at, None);
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(push.calls(), 1);
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// A slow channel keeps rows queued past their claim lease. The next pass
/// takes those rows over and the first pass must then leave them alone.
#[tokio::test(start_paused = true)]
async fn rows_outliving_their_lease_are_sent_once() {
    let email = ScriptedSender::slow(Channel::Email, Duration::from_secs(9));
    let config = EngineConfig {
        channel_concurrency: 1,
        ..EngineConfig::default()
    };
    let engine = engine_with(config, &[email.clone()]);
    let recipients: Vec<i64> = (1..=20).collect();
    engine
        .notifications
        .enqueue(TENANT, &request(recipients, vec![Channel::Email]), t0())
        .await
        .unwrap();

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.notifications.dispatch_due(t0()).await })
    };
    // Default lease is 120s; at 9s a send, rows near the back are still
    // waiting for the channel when it runs out.
    tokio::time::sleep(Duration::from_secs(130)).await;
    let second = engine
        .notifications
        .dispatch_due(t0() + chrono::Duration::seconds(130))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(second.claimed > 0);
    assert_eq!(first.claimed, 20);
    assert_eq!(first.skipped, second.claimed);
    assert_eq!(first.sent + second.sent, 20);
    assert_eq!(email.calls(), 20);

    let mut sent = email.sent();
    sent.sort();
    sent.dedup();
    assert_eq!(sent.len(), 20);
    for n in all_notifications(&engine).await {
        assert_eq!(n.status, NotificationStatus::Sent);
    }
}

#[tokio::test]
async fn racing_passes_over_the_same_rows_send_each_once() {
    let email = ScriptedSender::ok(Channel::Email);
    let engine = engine(&[email.clone()]);
    let rows = engine
        .notifications
        .enqueue(TENANT, &request((1..=10).collect(), vec![Channel::Email]), t0())
        .await
        .unwrap();
    let ids: Vec<i64> = rows.iter().map(|n| n.id).collect();

    let (a, b, c) = tokio::join!(
        engine.notifications.dispatch_ids(&ids, t0()),
        engine.notifications.dispatch_ids(&ids, t0()),
        engine.notifications.dispatch_due(t0()),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(a.claimed + b.claimed + c.claimed, 10);
    assert_eq!(a.sent + b.sent + c.sent, 10);
    assert_eq!(email.calls(), 10);
}

// ---------------------------------------------------------------------------
// Retry and dead letters
// ---------------------------------------------------------------------------

async fn sms_and_app(engine: &Engine) -> (Notification, Notification) {
    let rows = all_notifications(engine).await;
    let sms = rows.iter().find(|n| n.channel == Channel::Sms).unwrap().clone();
    let app = rows.iter().find(|n| n.channel == Channel::InApp).unwrap().clone();
    (sms, app)
}

#[tokio::test]
async fn each_retry_pass_counts_once_up_to_the_ceiling() {
    let sms = ScriptedSender::failing(Channel::Sms);
    let in_app = ScriptedSender::ok(Channel::InApp);
    let engine = engine(&[sms.clone(), in_app.clone()]);
    engine
        .notifications
        .send_notification(TENANT, &request(vec![1], vec![Channel::Sms, Channel::InApp]), t0())
        .await
        .unwrap();

    let (failed, sibling) = sms_and_app(&engine).await;
    assert_eq!(failed.retry_count, 1);
    assert_eq!(sibling.status, NotificationStatus::Sent);

    for (pass, expected) in [(5, 2), (10, 3), (15, 3), (20, 3)] {
        engine.notifications.retry_failed(minutes(pass)).await.unwrap();
        let (failed, sibling) = sms_and_app(&engine).await;
        assert_eq!(failed.retry_count, expected, "after retry pass at +{pass}m");
        assert_eq!(failed.status, NotificationStatus::Failed);
        assert_eq!(sibling.status, NotificationStatus::Sent);
        assert_eq!(sibling.retry_count, 0);
    }
    assert_eq!(sms.calls(), 3);
    assert_eq!(in_app.calls(), 1);
}

#[tokio::test]
async fn retry_window_excludes_old_failures() {
    let sms = ScriptedSender::failing(Channel::Sms);
    let engine = engine(&[sms.clone()]);
    engine
        .notifications
        .send_notification(TENANT, &request(vec![1], vec![Channel::Sms]), t0())
        .await
        .unwrap();

    let report = engine.notifications.retry_failed(minutes(25 * 60)).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(sms.calls(), 1);
}

#[tokio::test]
async fn dead_letters_clear_only_when_exhausted() {
    let sms = ScriptedSender::failing(Channel::Sms);
    let engine = engine(&[sms, ScriptedSender::ok(Channel::Email)]);
    engine
        .notifications
        .send_notification(TENANT, &request(vec![1], vec![Channel::Sms, Channel::Email]), t0())
        .await
        .unwrap();
    let rows = all_notifications(&engine).await;
    let sms_id = rows.iter().find(|n| n.channel == Channel::Sms).unwrap().id;
    let email_id = rows.iter().find(|n| n.channel == Channel::Email).unwrap().id;

    let early = engine
        .notifications
        .clear_dead_letters(TENANT, &[sms_id, email_id], minutes(1))
        .await
        .unwrap();
    assert_eq!(early, 0);

    engine.notifications.retry_failed(minutes(5)).await.unwrap();
    engine.notifications.retry_failed(minutes(10)).await.unwrap();
    let stats = engine
        .notifications
        .statistics(TENANT, t0(), minutes(1))
        .await
        .unwrap();
    assert_eq!(stats.dead_letters, 1);

    let cleared = engine
        .notifications
        .clear_dead_letters(TENANT, &[sms_id, email_id], minutes(11))
        .await
        .unwrap();
    assert_eq!(cleared, 1);
    assert!(engine.notifications.get(TENANT, sms_id).await.unwrap_err().is_not_found());
    assert!(engine.notifications.get(TENANT, email_id).await.is_ok());
}

// ---------------------------------------------------------------------------
// Recipient-side transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_read_only_moves_sent_rows() {
    let engine = engine(&[ScriptedSender::ok(Channel::Email), ScriptedSender::failing(Channel::Sms)]);
    engine
        .notifications
        .send_notification(TENANT, &request(vec![1], vec![Channel::Email, Channel::Sms]), t0())
        .await
        .unwrap();
    let expiring = request(vec![1], vec![Channel::Email])
        .scheduled_at(minutes(30))
        .expires_at(minutes(5));
    let expired_id = engine.notifications.enqueue(TENANT, &expiring, t0()).await.unwrap()[0].id;
    engine.notifications.expire_stale(minutes(6)).await.unwrap();

    let rows = all_notifications(&engine).await;
    let sent = rows.iter().find(|n| n.status == NotificationStatus::Sent).unwrap().id;
    let failed = rows.iter().find(|n| n.status == NotificationStatus::Failed).unwrap().id;
    assert_eq!(engine.notifications.unread_count(TENANT, 1).await.unwrap(), 1);

    for id in [failed, expired_id] {
        let result = engine.notifications.mark_read(TENANT, id, minutes(7)).await.unwrap();
        assert_matches!(result, Transition::Unchanged(_));
        assert_eq!(result.get().read_at, None);
    }

    let read = engine.notifications.mark_read(TENANT, sent, minutes(7)).await.unwrap();
    assert!(read.changed());
    assert_eq!(read.get().status, NotificationStatus::Read);
    assert_eq!(read.get().read_at, Some(minutes(7)));
    assert_eq!(engine.notifications.unread_count(TENANT, 1).await.unwrap(), 0);
}

#[tokio::test]
async fn delivery_receipts_then_read() {
    let engine = engine(&[ScriptedSender::ok(Channel::Push)]);
    let id = engine
        .notifications
        .send_notification(TENANT, &request(vec![4], vec![Channel::Push]), t0())
        .await
        .unwrap()[0];

    let delivered = engine.notifications.mark_delivered(TENANT, id, minutes(1)).await.unwrap();
    assert_eq!(delivered.get().status, NotificationStatus::Delivered);
    let again = engine.notifications.mark_delivered(TENANT, id, minutes(2)).await.unwrap();
    assert!(!again.changed());

    let read = engine.notifications.mark_read(TENANT, id, minutes(3)).await.unwrap();
    assert_eq!(read.get().status, NotificationStatus::Read);
    assert_eq!(read.get().delivered_at, Some(minutes(1)));
}

#[tokio::test]
async fn cancel_stops_pending_rows() {
    let email = ScriptedSender::ok(Channel::Email);
    let engine = engine(&[email.clone()]);
    let later = request(vec![1], vec![Channel::Email]).scheduled_at(minutes(30));
    let id = engine.notifications.enqueue(TENANT, &later, t0()).await.unwrap()[0].id;

    let cancelled = engine.notifications.cancel(TENANT, id, minutes(1)).await.unwrap();
    assert!(cancelled.changed());
    assert_eq!(cancelled.get().status, NotificationStatus::Cancelled);
    assert!(!engine.notifications.cancel(TENANT, id, minutes(2)).await.unwrap().changed());

    engine.notifications.dispatch_due(minutes(30)).await.unwrap();
    assert_eq!(email.calls(), 0);

    let err = engine.notifications.cancel(TENANT, 9999, minutes(3)).await.unwrap_err();
    assert!(err.is_not_found());
}

// ---------------------------------------------------------------------------
// Settings, rate limits and templates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limited_rows_are_recorded_not_sent() {
    let sms = ScriptedSender::ok(Channel::Sms);
    let engine = engine(&[
        ScriptedSender::ok(Channel::Email),
        ScriptedSender::ok(Channel::InApp),
        sms.clone(),
    ]);
    let mut dto = CreateSetting::new("PAYMENT_DUE", "Rent reminders", vec![7], vec![Channel::Email]);
    dto.hourly_limit = Some(2);
    let setting = engine.settings.create_setting(TENANT, &dto).await.unwrap();

    let three = request(vec![7], vec![Channel::InApp, Channel::Email, Channel::Sms])
        .under_setting(setting.id);
    engine.notifications.send_notification(TENANT, &three, t0()).await.unwrap();

    let rows = all_notifications(&engine).await;
    let limited: Vec<_> = rows
        .iter()
        .filter(|n| n.status == NotificationStatus::SuppressedByRateLimit)
        .collect();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].channel, Channel::Sms);
    assert!(limited[0]
        .error_message
        .as_deref()
        .is_some_and(|m| m.starts_with("Rate limit exceeded")));
    assert_eq!(sms.calls(), 0);

    let one = request(vec![7], vec![Channel::Sms]).under_setting(setting.id);
    engine.notifications.send_notification(TENANT, &one, minutes(10)).await.unwrap();
    assert_eq!(sms.calls(), 0);

    engine.notifications.send_notification(TENANT, &one, minutes(75)).await.unwrap();
    assert_eq!(sms.calls(), 1);
}

#[tokio::test]
async fn typed_content_uses_templates_per_channel() {
    let email = ScriptedSender::ok(Channel::Email);
    let engine = engine(&[email, ScriptedSender::ok(Channel::InApp)]);
    let template = engine
        .settings
        .create_template(
            TENANT,
            &CreateTemplate {
                name: "Rent reminder".into(),
                template_type: "PAYMENT_DUE".into(),
                channel: Channel::Email,
                language_code: "en".into(),
                subject_template: Some("Rent for {{unit}}".into()),
                body_template: "Hi {{ name }}, rent for {{unit}} is due. {{missing}}".into(),
                is_default: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(template.variables, vec!["missing", "name", "unit"]);

    let variables = [("name", "Ana"), ("unit", "4B")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let typed = NotificationRequest::new(
        "PAYMENT_DUE",
        vec![1],
        vec![Channel::Email, Channel::InApp],
        Content::Typed {
            language: Some("fr".into()),
            variables,
            title: "Rent due".into(),
            message: "Rent is due".into(),
        },
    );
    engine.notifications.send_notification(TENANT, &typed, t0()).await.unwrap();

    let rows = all_notifications(&engine).await;
    let email_row = rows.iter().find(|n| n.channel == Channel::Email).unwrap();
    assert_eq!(email_row.title, "Rent for 4B");
    assert_eq!(email_row.message, "Hi Ana, rent for 4B is due. ");
    assert_eq!(email_row.metadata["template_id"], serde_json::json!(template.id));

    let app_row = rows.iter().find(|n| n.channel == Channel::InApp).unwrap();
    assert_eq!(app_row.title, "Rent due");
    assert!(app_row.metadata.get("template_id").is_none());
}

#[tokio::test]
async fn statistics_cover_rates_and_channels() {
    let engine = engine(&[ScriptedSender::ok(Channel::Email), ScriptedSender::failing(Channel::Sms)]);
    let ids = engine
        .notifications
        .send_notification(TENANT, &request(vec![1, 2], vec![Channel::Email, Channel::Sms]), t0())
        .await
        .unwrap();
    let rows = all_notifications(&engine).await;
    let first_email = rows
        .iter()
        .find(|n| n.channel == Channel::Email && ids.contains(&n.id))
        .unwrap()
        .id;
    engine.notifications.mark_delivered(TENANT, first_email, minutes(1)).await.unwrap();

    let stats = engine
        .notifications
        .statistics(TENANT, t0(), minutes(5))
        .await
        .unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_channel.get(&Channel::Email), Some(&2));
    assert_eq!(stats.by_channel.get(&Channel::Sms), Some(&2));
    assert_eq!(stats.by_status.get("FAILED"), Some(&2));
    assert!((stats.failure_rate - 0.5).abs() < f64::EPSILON);
    assert!((stats.delivery_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(stats.read_rate, 0.0);
}
