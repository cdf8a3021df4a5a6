//! Whole runs: real API clients against mock servers, store mocked or SQLite

use assert_matches::assert_matches;
use bond_rate_sync::api::{join_ids, CouponDateClient, SecurityRateClient};
use bond_rate_sync::config::CouponCutoff;
use bond_rate_sync::database::{FlagStatus, RateStore};
use bond_rate_sync::error::{ApiError, DispatchError, StoreError, SyncError};
use bond_rate_sync::models::{ReconciledRow, SecurityId};
use bond_rate_sync::orchestrator::{Orchestrator, RunState};
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};
use test_log::test;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::database::{init_test_store, insert_recon_row, recon_rows};
use crate::common::fixtures::{api_config, as_of, bond_ids, coupon_body, dispatch, security_body};
use crate::common::MockStore;

type TestOrchestrator<D> = Orchestrator<D, SecurityRateClient, CouponDateClient>;

fn orchestrator<D>(store: D, security: &MockServer, coupon: &MockServer) -> TestOrchestrator<D>
where
    D: RateStore,
{
    Orchestrator::new(
        store,
        SecurityRateClient::new(&api_config(security, "/security")).unwrap(),
        CouponDateClient::new(&api_config(coupon, "/coupons"), CouponCutoff::AsOf).unwrap(),
        dispatch(),
    )
}

fn ids(list: &[&str]) -> Vec<SecurityId> {
    list.iter().map(|id| SecurityId::new(*id)).collect()
}

/// Mock store that hands out `eligible` and records what gets saved.
fn recording_store(eligible: Vec<SecurityId>, saved: Arc<Mutex<Vec<ReconciledRow>>>) -> MockStore {
    let mut store = MockStore::new();
    store
        .expect_fetch_eligible_securities()
        .times(1)
        .returning(move |_| Ok(eligible.clone()));
    store.expect_save_rates().times(1).returning(move |rows, _| {
        saved.lock().unwrap().extend(rows.iter().cloned());
        Ok(rows.len())
    });
    store.expect_flag_rerated().times(1).returning(|as_of| {
        Ok(FlagStatus {
            as_of_date: as_of,
            completed_at: Utc::now(),
        })
    });
    store
}

#[test(tokio::test)]
async fn test_fixed_and_floating_bonds_reconcile() {
    let security = MockServer::start().await;
    let coupon = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/security"))
        .and(query_param("bondId", "US001,US002,"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bondByAssetId": {
                "US001": {
                    "bondId": "US001",
                    "rec": { "BOND": "US001", "couponFix": 0.05, "cpnType": "F" }
                },
                "US002": {
                    "bondId": "US002",
                    "rec": { "BOND": "US002", "couponFloat": 0.03, "cpnType": "V" }
                }
            }
        })))
        .expect(1)
        .mount(&security)
        .await;
    Mock::given(method("GET"))
        .and(path("/coupons"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "couponDataByAssetId": {
                "US001": { "couponEffectiveDate": {
                    "2024-01-01": { "cpn": 0.05 },
                    "2025-01-01": { "cpn": 0.06 }
                } }
            }
        })))
        .expect(1)
        .mount(&coupon)
        .await;

    let saved = Arc::new(Mutex::new(Vec::new()));
    let store = recording_store(ids(&["US001", "US002"]), Arc::clone(&saved));
    let mut run = orchestrator(store, &security, &coupon);

    let summary = run.run(as_of()).await.unwrap();

    let mut rows = saved.lock().unwrap().clone();
    rows.sort_by(|a, b| a.bond_id.cmp(&b.bond_id));
    assert_eq!(
        rows,
        vec![
            ReconciledRow {
                as_of_date: as_of(),
                bond_id: "US001".into(),
                rate: 0.05,
                effective_date: Some("2025-01-01".into()),
            },
            ReconciledRow {
                as_of_date: as_of(),
                bond_id: "US002".into(),
                rate: 0.03,
                effective_date: None,
            },
        ]
    );
    assert_eq!(summary.eligible_securities, 2);
    assert_eq!(summary.security_rates, 2);
    assert_eq!(summary.coupon_records, 1);
    assert_eq!(summary.rows_submitted, 2);
    assert!(summary.rerate_flagged);
    assert_eq!(run.state(), RunState::Done);
}

#[test(tokio::test)]
async fn test_each_api_gets_its_own_asset_class() {
    let security = MockServer::start().await;
    let coupon = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("bondIdType", "BOND"))
        .respond_with(ResponseTemplate::new(200).set_body_json(security_body(&[("US001", 0.05)])))
        .expect(1)
        .mount(&security)
        .await;
    Mock::given(method("GET"))
        .and(query_param("bondIdType", "MUNI"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(coupon_body(&[("US001", "2025-01-01", 0.05)])),
        )
        .expect(1)
        .mount(&coupon)
        .await;

    let mut coupon_config = api_config(&coupon, "/coupons");
    coupon_config.asset_class = "MUNI".to_string();
    let saved = Arc::new(Mutex::new(Vec::new()));
    let mut run = Orchestrator::new(
        recording_store(ids(&["US001"]), Arc::clone(&saved)),
        SecurityRateClient::new(&api_config(&security, "/security")).unwrap(),
        CouponDateClient::new(&coupon_config, CouponCutoff::AsOf).unwrap(),
        dispatch(),
    );

    let summary = run.run(as_of()).await.unwrap();

    assert_eq!(summary.security_rates, 1);
    assert_eq!(summary.coupon_records, 1);
    let rows = saved.lock().unwrap().clone();
    assert_eq!(rows[0].effective_date.as_deref(), Some("2025-01-01"));
}

#[test(tokio::test)]
async fn test_nothing_to_check_skips_apis_and_writes() {
    let security = MockServer::start().await;
    let coupon = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&security)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&coupon)
        .await;

    let mut store = MockStore::new();
    store
        .expect_fetch_eligible_securities()
        .times(1)
        .returning(|_| Ok(Vec::new()));
    store.expect_save_rates().times(0);
    store.expect_flag_rerated().times(0);

    let mut run = orchestrator(store, &security, &coupon);
    let summary = run.run(as_of()).await.unwrap();

    assert_eq!(summary.eligible_securities, 0);
    assert_eq!(summary.rows_submitted, 0);
    assert!(!summary.rerate_flagged);
    assert_eq!(run.state(), RunState::Done);
}

#[test(tokio::test)]
async fn test_one_failing_batch_aborts_before_any_write() {
    let security = MockServer::start().await;
    let coupon = MockServer::start().await;
    let eligible = bond_ids(120);

    Mock::given(method("GET"))
        .and(query_param("bondId", join_ids(&eligible[50..100]).as_str()))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream timeout"))
        .with_priority(1)
        .mount(&security)
        .await;
    let security_ok = security_body(&[("US0000", 0.05)]);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(security_ok))
        .mount(&security)
        .await;
    let coupon_ok = coupon_body(&[("US0000", "2025-01-01", 0.05)]);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coupon_ok))
        .mount(&coupon)
        .await;

    let mut store = MockStore::new();
    let listed = eligible.clone();
    store
        .expect_fetch_eligible_securities()
        .returning(move |_| Ok(listed.clone()));
    store.expect_save_rates().times(0);
    store.expect_flag_rerated().times(0);

    let mut run = orchestrator(store, &security, &coupon);
    let result = run.run(as_of()).await;

    assert_matches!(
        result,
        Err(SyncError::SecurityFetch(DispatchError::Batch {
            batch: 2,
            total: 3,
            size: 50,
            source: ApiError::Status { .. },
        }))
    );
    assert_eq!(run.state(), RunState::Aborted);
}

#[test(tokio::test)]
async fn test_store_failure_aborts_run() {
    let security = MockServer::start().await;
    let coupon = MockServer::start().await;

    let mut store = MockStore::new();
    store.expect_fetch_eligible_securities().returning(|_| {
        Err(StoreError::Query {
            operation: "fetch eligible securities",
            source: sqlx::Error::PoolTimedOut,
        })
    });

    let mut run = orchestrator(store, &security, &coupon);
    let result = run.run(as_of()).await;

    assert_matches!(result, Err(SyncError::Store(StoreError::Query { .. })));
    assert_eq!(run.state(), RunState::Aborted);
    assert!(security.received_requests().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_end_to_end_against_sqlite() {
    let security = MockServer::start().await;
    let coupon = MockServer::start().await;
    let security_rates = security_body(&[("US001", 0.06), ("US002", 0.03)]);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(security_rates))
        .mount(&security)
        .await;
    let coupon_dates = coupon_body(&[("US001", "2025-01-01", 0.06)]);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coupon_dates))
        .mount(&coupon)
        .await;

    let store = init_test_store(500).await;
    insert_recon_row(&store, "US001", "2025-06-01", 0.05).await;
    insert_recon_row(&store, "US002", "2025-06-01", 0.03).await;

    let mut run = orchestrator(store, &security, &coupon);
    let summary = run.run(as_of()).await.unwrap();
    assert_eq!(summary.rows_submitted, 2);

    let state = recon_rows(run.store(), "2025-06-01").await;
    assert_eq!(state[0].api_rate, Some(0.06));
    assert_eq!(state[0].cpn_effective_date.as_deref(), Some("2025-01-01"));
    assert_eq!(state[0].rerate_flag, 1);
    assert_eq!(state[1].api_rate, Some(0.03));
    assert_eq!(state[1].cpn_effective_date, None);
    assert_eq!(state[1].rerate_flag, 0);
}
