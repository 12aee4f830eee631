//! Functional tests for the deploy/upgrade engine.
//!
//! Core guarantees exercised here:
//! - `ensure` is idempotent: a second call with unchanged inputs performs no
//!   remote mutation and returns the stored record.
//! - The action taken is decided by (classification, kind) alone.
//! - External records are never deployed over or upgraded.
//! - Transient remote failures are retried; exhausted retries leave the store
//!   untouched so the run can be repeated.

use pretty_assertions::assert_eq;
use rollout_artifact::{BuildRef, Fingerprint, InlineArtifact};
use rollout_kernel::engine::{EnsureAction, EnsureRequest, StaleRecordPolicy};
use rollout_kernel::journal::JournalAction;
use rollout_kernel::remote::UpgradeOptions;
use rollout_kernel::store::{MemoryRecordStore, RecordStore};
use rollout_kernel::types::{Address, DeploymentKind, Interface};
use rollout_kernel::DeployError;
use rollout_test_utils::{build_output, instant_retry, Harness};
use serde_json::json;
use std::sync::Arc;

fn addr(n: u64) -> Address {
    Address::new(format!("0x{n:040x}"))
}

fn request(name: &str, kind: DeploymentKind) -> EnsureRequest {
    EnsureRequest::new(name, kind, BuildRef::catalog(name))
}

/// Tenet: an empty store gets exactly one deployment.
///
/// Store empty, target `A` of kind Direct: after `ensure` the store holds
/// exactly `{A: {address: addr1, fingerprint: fpX}}`.
#[tokio::test]
async fn fresh_direct_target_is_deployed_once() {
    let h = Harness::new();
    let fp_x = h.publish("A", b"runtime-x");

    let ensured = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    assert_eq!(ensured.action, EnsureAction::Deployed);
    assert_eq!(h.chain.deploys(), 1);
    assert_eq!(h.store.names().unwrap(), vec!["A".to_string()]);
    let stored = h.record("A").unwrap();
    assert_eq!(stored.address, addr(1));
    assert_eq!(stored.code_fingerprint, Some(fp_x));
    assert_eq!(stored, ensured.record);
}

/// Tenet: repeated runs are no-ops.
///
/// Two consecutive `ensure` calls with identical inputs issue exactly one
/// remote mutation across both, and the second returns the stored record.
#[tokio::test]
async fn second_ensure_is_a_noop() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");

    let first = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();
    let second = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    assert_eq!(second.action, EnsureAction::NoOp);
    assert_eq!(second.record, first.record);
    assert_eq!(h.chain.mutations(), 1);
}

/// Tenet: a changed direct target is replaced through the shadow swap.
///
/// Final state is `{A: {address: addr2, fingerprint: fpY}}` with no `A_NEW`.
#[tokio::test]
async fn changed_direct_target_is_migrated() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");
    h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    let fp_y = h.publish("A", b"runtime-y");
    let ensured = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    assert_eq!(ensured.action, EnsureAction::Migrated);
    assert_eq!(h.store.names().unwrap(), vec!["A".to_string()]);
    let stored = h.record("A").unwrap();
    assert_eq!(stored.name, "A");
    assert_eq!(stored.address, addr(2));
    assert_eq!(stored.code_fingerprint, Some(fp_y));
    assert!(h.record("A_NEW").is_none());

    let journal = h.engine.journal();
    assert_eq!(
        journal.actions_for("A"),
        vec![JournalAction::Deploy, JournalAction::Promote]
    );
    assert_eq!(journal.actions_for("A_NEW"), vec![JournalAction::StageShadow]);
    assert!(journal.verify_integrity().is_ok());
}

/// Tenet: proxies keep their address across upgrades.
#[tokio::test]
async fn proxy_is_upgraded_in_place() {
    let h = Harness::new();
    h.publish("Vault", b"vault-v1");
    let deployed = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap();
    let proxy = deployed.record.address.clone();
    assert_eq!(deployed.record.implementation, h.chain.implementation_of(&proxy));

    let fp_v2 = h.publish("Vault", b"vault-v2");
    let upgraded = h
        .engine
        .ensure(
            &request("Vault", DeploymentKind::ProxyUups)
                .upgrade(UpgradeOptions::with_call("initializeV2", vec![json!(2)])),
        )
        .await
        .unwrap();

    assert_eq!(upgraded.action, EnsureAction::Upgraded);
    assert_eq!(upgraded.record.address, proxy);
    assert_eq!(upgraded.record.code_fingerprint, Some(fp_v2));
    assert_eq!(upgraded.record.implementation, h.chain.implementation_of(&proxy));
    assert_ne!(upgraded.record.implementation, deployed.record.implementation);
    assert_eq!(h.chain.upgrades(), 1);
    assert_eq!(h.chain.deploys(), 1);
    let calls = h.chain.upgrade_calls();
    assert_eq!(calls[0].as_ref().map(|c| c.method.as_str()), Some("initializeV2"));

    let again = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap();
    assert_eq!(again.action, EnsureAction::NoOp);
    assert_eq!(h.chain.mutations(), 2);
}

#[tokio::test]
async fn beacon_is_upgraded_in_place() {
    let h = Harness::new();
    h.publish("Pair", b"pair-v1");
    let first = h.engine.ensure(&request("Pair", DeploymentKind::Beacon)).await.unwrap();
    h.publish("Pair", b"pair-v2");
    let second = h.engine.ensure(&request("Pair", DeploymentKind::Beacon)).await.unwrap();

    assert_eq!(second.action, EnsureAction::Upgraded);
    assert_eq!(second.record.address, first.record.address);
    assert!(h.record("Pair_NEW").is_none());
}

/// Tenet: the engine never touches what it does not own.
#[tokio::test]
async fn external_records_are_never_deployed_over() {
    let h = Harness::new();
    h.publish("Weth", b"weth");
    let adopted = h
        .engine
        .adopt_external("Weth", Address::new("0xc02a"), Interface(json!([])))
        .unwrap();
    assert_eq!(adopted.action, EnsureAction::Adopted);
    assert_eq!(adopted.record.code_fingerprint, None);

    let err = h
        .engine
        .ensure(&request("Weth", DeploymentKind::Direct))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ForeignRecordImmutable(ref n) if n == "Weth"));
    assert_eq!(h.chain.mutations(), 0);
    assert_eq!(h.record("Weth").unwrap(), adopted.record);
}

#[tokio::test]
async fn external_kind_cannot_be_ensured() {
    let h = Harness::new();
    h.publish("Weth", b"weth");
    let err = h
        .engine
        .ensure(&request("Weth", DeploymentKind::External))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ForeignRecordImmutable(_)));
    assert_eq!(h.chain.mutation_attempts(), 0);
}

#[tokio::test]
async fn adopting_over_an_owned_record_is_rejected() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");
    h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    let err = h
        .engine
        .adopt_external("A", Address::new("0xdead"), Interface::default())
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::OwnedRecordConflict { ref address, .. } if *address == addr(1)
    ));
}

#[tokio::test]
async fn readopting_the_same_address_is_a_noop() {
    let h = Harness::new();
    let first = h
        .engine
        .adopt_external("Usdc", Address::new("0xa0b8"), Interface::default())
        .unwrap();
    let second = h
        .engine
        .adopt_external("Usdc", Address::new("0xa0b8"), Interface::default())
        .unwrap();
    let moved = h
        .engine
        .adopt_external("Usdc", Address::new("0xa0b9"), Interface::default())
        .unwrap();

    assert_eq!(second.action, EnsureAction::NoOp);
    assert_eq!(second.record, first.record);
    assert_eq!(moved.action, EnsureAction::Adopted);
    assert_eq!(
        h.engine.journal().actions_for("Usdc"),
        vec![JournalAction::Adopt, JournalAction::Adopt]
    );
}

#[tokio::test]
async fn kind_mismatch_is_rejected() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");
    h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    let err = h
        .engine
        .ensure(&request("A", DeploymentKind::ProxyUups))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::KindMismatch {
            recorded: DeploymentKind::Direct,
            requested: DeploymentKind::ProxyUups,
            ..
        }
    ));
    assert_eq!(h.chain.mutations(), 1);
}

/// Tenet: a stale record is redeployed by default.
#[tokio::test]
async fn vanished_code_is_redeployed_by_default() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");
    h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    h.chain.reset();
    let ensured = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    assert_eq!(ensured.action, EnsureAction::Deployed);
    assert_eq!(ensured.record.address, addr(2));
    assert_eq!(h.chain.deploys(), 2);
}

/// Tenet: under the strict policy a stale record is an environment mismatch.
#[tokio::test]
async fn vanished_code_fails_under_strict_policy() {
    let h = Harness::build(Arc::new(MemoryRecordStore::new()), |engine| {
        engine.with_stale_record_policy(StaleRecordPolicy::Fail)
    });
    h.publish("A", b"runtime-x");
    h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    h.chain.clear_code(&addr(1));
    let err = h
        .engine
        .ensure(&request("A", DeploymentKind::Direct))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::EnvironmentMismatch { ref address, .. } if *address == addr(1)
    ));
    assert_eq!(h.chain.deploys(), 1);
    assert_eq!(h.record("A").unwrap().address, addr(1));
}

/// Tenet: transient failures are absorbed by the retry executor.
#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");
    h.chain.fail_next_mutations(2);

    let ensured = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();

    assert_eq!(ensured.action, EnsureAction::Deployed);
    assert_eq!(h.chain.mutation_attempts(), 3);
    assert_eq!(h.chain.deploys(), 1);
}

/// Tenet: exhausted retries leave the store untouched and are re-runnable.
#[tokio::test]
async fn exhausted_retries_leave_store_untouched() {
    let h = Harness::new();
    h.publish("A", b"runtime-x");
    h.chain.fail_next_mutations(10);

    let err = h
        .engine
        .ensure(&request("A", DeploymentKind::Direct))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::RetryExhausted { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert!(h.store.is_empty());

    h.chain.fail_next_mutations(0);
    let ensured = h.engine.ensure(&request("A", DeploymentKind::Direct)).await.unwrap();
    assert_eq!(ensured.action, EnsureAction::Deployed);
}

#[tokio::test]
async fn failed_upgrade_leaves_record_untouched() {
    let h = Harness::build(Arc::new(MemoryRecordStore::new()), |engine| {
        engine.with_retry_policy(instant_retry(2))
    });
    h.publish("Vault", b"vault-v1");
    let before = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap()
        .record;

    h.publish("Vault", b"vault-v2");
    h.chain.fail_next_mutations(2);
    let err = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::RetryExhausted { attempts: 2, .. }));
    assert_eq!(h.record("Vault").unwrap(), before);
}

/// Tenet: a landed upgrade is persisted before anything else can fail.
///
/// The implementation lookup that follows the upgrade keeps timing out. The
/// new fingerprint is already stored, and the next run fills in the moved
/// implementation without upgrading again.
#[tokio::test]
async fn upgrade_survives_failed_implementation_lookup() {
    let h = Harness::new();
    h.publish("Vault", b"vault-v1");
    let proxy = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap()
        .record
        .address;

    let fp_v2 = h.publish("Vault", b"vault-v2");
    h.chain.fail_reads_after_upgrade(3);
    let err = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::RetryExhausted { ref label, .. } if label == "read implementation of Vault"));
    assert_eq!(h.record("Vault").unwrap().code_fingerprint, Some(fp_v2));

    let rerun = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap();

    assert_eq!(rerun.action, EnsureAction::NoOp);
    assert_eq!(h.chain.upgrades(), 1);
    let stored = h.record("Vault").unwrap();
    assert_eq!(stored, rerun.record);
    assert_eq!(stored.address, proxy);
    assert_eq!(stored.code_fingerprint, Some(fp_v2));
    assert_eq!(stored.implementation, h.chain.implementation_of(&proxy));
}

#[tokio::test]
async fn up_to_date_record_with_stale_fields_is_refreshed() {
    let h = Harness::new();
    let fp = h.publish("Vault", b"vault-v1");
    let deployed = h
        .engine
        .ensure(&request("Vault", DeploymentKind::Beacon))
        .await
        .unwrap()
        .record;
    let mut stale = deployed.clone();
    stale.code_fingerprint = None;
    stale.implementation = Some(Address::new("0xdead"));
    h.store.save("Vault", &stale).unwrap();

    let ensured = h
        .engine
        .ensure(&request("Vault", DeploymentKind::Beacon))
        .await
        .unwrap();

    assert_eq!(ensured.action, EnsureAction::NoOp);
    assert_eq!(ensured.record, deployed);
    assert_eq!(h.record("Vault").unwrap().code_fingerprint, Some(fp));
    assert_eq!(h.chain.mutations(), 1);
}

/// Tenet: a proxy on a wiped network is treated as a stale record.
#[tokio::test]
async fn wiped_proxy_is_redeployed_by_default() {
    let h = Harness::new();
    h.publish("Vault", b"vault-v1");
    let first = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap();

    h.chain.reset();
    let second = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap();

    assert_eq!(second.action, EnsureAction::Deployed);
    assert_ne!(second.record.address, first.record.address);
    assert_eq!(second.record.implementation, h.chain.implementation_of(&second.record.address));
    assert_eq!(h.chain.deploys(), 2);
}

#[tokio::test]
async fn wiped_proxy_fails_under_strict_policy() {
    let h = Harness::build(Arc::new(MemoryRecordStore::new()), |engine| {
        engine.with_stale_record_policy(StaleRecordPolicy::Fail)
    });
    h.publish("Vault", b"vault-v1");
    let deployed = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap()
        .record;

    h.chain.reset();
    let err = h
        .engine
        .ensure(&request("Vault", DeploymentKind::ProxyUups))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::EnvironmentMismatch { ref address, .. } if *address == deployed.address
    ));
    assert_eq!(h.chain.deploys(), 1);
    assert_eq!(h.record("Vault").unwrap(), deployed);
}

#[tokio::test]
async fn unknown_artifact_fails_before_any_remote_call() {
    let h = Harness::new();
    let err = h
        .engine
        .ensure(&request("Ghost", DeploymentKind::Direct))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ArtifactNotFound(ref n) if n == "Ghost"));
    assert_eq!(h.chain.mutation_attempts(), 0);
}

/// Tenet: inline payloads without runtime code are fingerprinted from the
/// code actually installed.
#[tokio::test]
async fn inline_payload_without_runtime_code() {
    let h = Harness::new();
    let build = BuildRef::Inline(InlineArtifact {
        interface: json!([{"name": "latestAnswer"}]),
        bytecode: b"feed".to_vec(),
        deployed_bytecode: None,
    });
    let req = EnsureRequest::new("Feed", DeploymentKind::Direct, build)
        .args(vec![json!(8), json!("ETH / USD")]);

    let first = h.engine.ensure(&req).await.unwrap();
    assert_eq!(first.record.code_fingerprint, Some(Fingerprint::of_code(b"feed")));
    assert_eq!(first.record.args, vec![json!(8), json!("ETH / USD")]);

    let second = h.engine.ensure(&req).await.unwrap();
    assert_eq!(second.action, EnsureAction::NoOp);
    assert_eq!(h.chain.mutations(), 1);
}

/// Tenet: a build output with empty runtime code is treated as unknown, not
/// as the fingerprint of nothing.
#[tokio::test]
async fn empty_runtime_code_does_not_force_redeploys() {
    let h = Harness::new();
    h.catalog.insert(build_output("Blank", b""));

    let first = h.engine.ensure(&request("Blank", DeploymentKind::Direct)).await.unwrap();
    assert_eq!(first.action, EnsureAction::Deployed);
    assert_ne!(first.record.code_fingerprint, Some(Fingerprint::of_code(b"")));

    let second = h.engine.ensure(&request("Blank", DeploymentKind::Direct)).await.unwrap();
    assert_eq!(second.action, EnsureAction::NoOp);
    assert_eq!(second.record, first.record);
    assert_eq!(h.chain.mutations(), 1);
}
