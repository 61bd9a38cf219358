//! Repository tests against a live Postgres.
//!
//! These need `DATABASE_URL` and are ignored by default:
//! `cargo test -p beacon-db -- --ignored`.

use assert_matches::assert_matches;
use beacon_core::alert::{state_machine, Alert, AlertStatus, RaiseAlert, Severity, SourceKey};
use beacon_core::notification::{Channel, NewNotification, NotificationStatus, PRIORITY_NORMAL, PRIORITY_URGENT};
use beacon_core::settings::CreateSetting;
use beacon_core::template::CreateTemplate;
use beacon_core::types::{Metadata, Timestamp};
use beacon_db::repositories::{AlertRepo, NotificationRepo, NotificationSettingRepo, TemplateRepo};
use chrono::{Duration, TimeZone, Utc};
use sqlx::PgPool;

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn boiler_alert() -> Alert {
    state_machine::open(
        1,
        RaiseAlert::new(SourceKey::new("equipment", "boiler-7", "PRESSURE_HIGH"), Severity::High),
        t0(),
    )
}

fn pending(recipient_id: i64, channel: Channel, priority_level: i32) -> NewNotification {
    NewNotification {
        tenant_id: 1,
        alert_id: None,
        setting_id: None,
        recipient_id,
        notification_type: "PRESSURE_HIGH".into(),
        title: "Boiler pressure".into(),
        message: "Pressure above limit".into(),
        channel,
        status: NotificationStatus::Pending,
        priority_level,
        scheduled_at: None,
        expires_at: None,
        error_message: None,
        metadata: Metadata::new(),
        created_at: Utc::now(),
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn health_check_passes(pool: PgPool) {
    beacon_db::health_check(&pool).await.unwrap();
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn second_open_alert_for_key_is_rejected(pool: PgPool) {
    AlertRepo::insert(&pool, &boiler_alert()).await.unwrap();
    let err = AlertRepo::insert(&pool, &boiler_alert()).await.unwrap_err();
    assert!(beacon_db::is_unique_violation(&err));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn versioned_update_rejects_stale_writer(pool: PgPool) {
    let row = AlertRepo::insert(&pool, &boiler_alert()).await.unwrap();
    let alert = Alert::try_from(row).unwrap();

    let acked = state_machine::acknowledge(&alert, Some(5), t0()).unwrap();
    let written = AlertRepo::update_versioned(&pool, &acked).await.unwrap().unwrap();
    assert_eq!(written.version, alert.version + 1);
    assert_eq!(written.status, "ACKNOWLEDGED");

    // Same base version again: lost race.
    let stale = state_machine::resolve(&alert, None, None, t0()).unwrap();
    assert_matches!(AlertRepo::update_versioned(&pool, &stale).await, Ok(None));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn latest_for_key_skips_expired(pool: PgPool) {
    let row = AlertRepo::insert(&pool, &boiler_alert()).await.unwrap();
    let alert = Alert::try_from(row).unwrap();
    let expired = state_machine::expire(&alert).unwrap();
    AlertRepo::update_versioned(&pool, &expired).await.unwrap().unwrap();

    let found = AlertRepo::find_latest_for_key(&pool, 1, &alert.key()).await.unwrap();
    assert!(found.is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn escalation_candidates_respect_threshold(pool: PgPool) {
    AlertRepo::insert(&pool, &boiler_alert()).await.unwrap();

    let early = AlertRepo::list_escalation_candidates(&pool, 1, t0() - Duration::minutes(1), 3)
        .await
        .unwrap();
    assert!(early.is_empty());

    let late = AlertRepo::list_escalation_candidates(&pool, 1, t0() + Duration::minutes(1), 3)
        .await
        .unwrap();
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].status, AlertStatus::Active.as_str());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn claim_orders_by_priority_and_skips_leased(pool: PgPool) {
    let rows = NotificationRepo::insert_batch(
        &pool,
        &[
            pending(1, Channel::Email, PRIORITY_NORMAL),
            pending(2, Channel::Sms, PRIORITY_URGENT),
        ],
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);

    let now = Utc::now();
    let claimed = NotificationRepo::claim_due(&pool, now, now + Duration::seconds(60), 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].priority_level, PRIORITY_URGENT);

    // The leased row is not handed out again.
    let rest = NotificationRepo::claim_due(&pool, now, now + Duration::seconds(60), 10)
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].recipient_id, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn expired_pending_rows_are_expired_not_claimed(pool: PgPool) {
    let now = Utc::now();
    let mut stale = pending(1, Channel::Push, PRIORITY_NORMAL);
    stale.expires_at = Some(now - Duration::minutes(1));
    NotificationRepo::insert_batch(&pool, &[stale]).await.unwrap();

    let claimed = NotificationRepo::claim_due(&pool, now, now + Duration::seconds(60), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(NotificationRepo::expire_stale(&pool, now).await.unwrap(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn setting_round_trip_and_toggle(pool: PgPool) {
    let dto = CreateSetting::new("PRESSURE_HIGH", "Boiler room", vec![10, 11], vec![Channel::Sms]);
    let row = NotificationSettingRepo::create(&pool, 1, &dto).await.unwrap();
    assert_eq!(row.channels, vec!["SMS".to_string()]);

    let toggled = NotificationSettingRepo::toggle(&pool, 1, row.id).await.unwrap().unwrap();
    assert!(!toggled.is_active);
    let active = NotificationSettingRepo::list_active_by_type(&pool, 1, "PRESSURE_HIGH")
        .await
        .unwrap();
    assert!(active.is_empty());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn set_default_clears_previous_default(pool: PgPool) {
    let dto = |name: &str, is_default: bool| CreateTemplate {
        name: name.into(),
        template_type: "PRESSURE_HIGH".into(),
        channel: Channel::Email,
        language_code: "en".into(),
        subject_template: Some("{{title}}".into()),
        body_template: "{{message}}".into(),
        is_default,
    };
    let first = TemplateRepo::create(&pool, 1, &dto("first", true)).await.unwrap();
    let second = TemplateRepo::create(&pool, 1, &dto("second", false)).await.unwrap();
    assert_eq!(first.variables, vec!["message".to_string(), "title".to_string()]);

    TemplateRepo::set_default(&pool, 1, second.id).await.unwrap().unwrap();

    let all = TemplateRepo::list_for(&pool, 1, "PRESSURE_HIGH", Channel::Email)
        .await
        .unwrap();
    let defaults: Vec<i64> = all.iter().filter(|t| t.is_default).map(|t| t.id).collect();
    assert_eq!(defaults, vec![second.id]);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn contact_upsert_replaces_address(pool: PgPool) {
    use beacon_db::repositories::ContactRepo;

    ContactRepo::upsert(&pool, 1, 10, Channel::Email, "old@example.com").await.unwrap();
    ContactRepo::upsert(&pool, 1, 10, Channel::Email, "ops@example.com").await.unwrap();
    let found = ContactRepo::find_address(&pool, 1, 10, Channel::Email).await.unwrap();
    assert_eq!(found.as_deref(), Some("ops@example.com"));
    assert!(ContactRepo::find_address(&pool, 1, 10, Channel::Sms).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn audit_events_list_newest_first(pool: PgPool) {
    use beacon_db::models::audit::CreateAuditEvent;
    use beacon_db::repositories::AuditEventRepo;

    for (offset, event_type) in [(0, "alert.raised"), (5, "alert.acknowledged")] {
        let event = CreateAuditEvent {
            tenant_id: Some(1),
            event_type: event_type.into(),
            entity_type: Some("alert".into()),
            entity_id: Some(42),
            actor_id: None,
            payload: serde_json::json!({ "alert_id": 42 }),
            occurred_at: t0() + Duration::minutes(offset),
        };
        AuditEventRepo::insert(&pool, &event).await.unwrap();
    }

    let rows = AuditEventRepo::list_for_entity(&pool, "alert", 42, 10).await.unwrap();
    let types: Vec<&str> = rows.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(types, vec!["alert.acknowledged", "alert.raised"]);
    assert!(AuditEventRepo::list_for_entity(&pool, "alert", 7, 10).await.unwrap().is_empty());
}
