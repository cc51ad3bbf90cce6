// End-to-end tests: a DomainMap driven by the worker, read back through the
// HTTP API with the map client, verifying every proof the server hands out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dt_map::keys;
use dt_map::map::{DomainMap, DomainTreeEntry, DomainTreeRoot, LogRevision};
use dt_map::mapclient::MapClient;
use dt_map::merkle;
use dt_map::server;
use dt_map::server::types::*;
use dt_map::smt;
use dt_map::worker::{start_worker, Transaction, WorkerConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;

struct TestMap {
    dm: Arc<DomainMap>,
    client: MapClient,
    transactions: tokio::sync::mpsc::Sender<Transaction>,
    _shutdown: watch::Sender<bool>,
}

async fn start_test_map() -> TestMap {
    let dir = tempfile::tempdir().unwrap();
    let signer = keys::load_or_generate_keys(
        &dir.path().join("privatekey.pem"),
        &dir.path().join("publickey.pem"),
    )
    .unwrap();
    let dm = Arc::new(DomainMap::new(signer));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = WorkerConfig {
        buffer_size: 8,
        update_period: Duration::from_millis(50),
        mmd: Duration::from_millis(1100),
    };
    let (transactions, _handle) = start_worker(Arc::clone(&dm), config, shutdown_rx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let dm = Arc::clone(&dm);
        tokio::spawn(async move {
            axum::serve(listener, server::router(dm)).await.unwrap();
        });
    }

    let client = MapClient::new(&format!("http://{addr}"), Some(dm.public_key())).unwrap();
    TestMap { dm, client, transactions, _shutdown: shutdown_tx }
}

fn transaction(log_index: u64, tree_size: u64, domains: &[(&str, &[u64])]) -> Transaction {
    let mut new_cert_indices = HashMap::new();
    for (domain, indices) in domains {
        new_cert_indices.insert(domain.to_string(), indices.to_vec());
    }
    Transaction {
        log_index,
        log_id: [log_index as u8 + 1; 32],
        log_revision: LogRevision { tree_size, root_hash: [0xa0 + log_index as u8; 32] },
        new_cert_indices,
    }
}

async fn wait_for_map_size(dm: &DomainMap, size: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if dm.get_latest_smh().head.map_size == size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for map size {size}"));
}

// The empty map: size 0, all-zero roots, no revisions; and the signature
// obtained by republishing the empty head verifies.
#[tokio::test]
async fn empty_map_head_is_well_formed() {
    let tm = start_test_map().await;

    let smh = tm.dm.get_latest_smh();
    assert_eq!(smh.head.map_size, 0);
    assert_eq!(smh.head.map_root_hash, [0; 32]);
    assert_eq!(smh.head.source_tree_root_hash, [0; 32]);
    assert!(smh.head.source_log_revisions.is_empty());

    // The worker skips MMD publishes while the map is empty, but an explicit
    // republish of the empty head is valid and signed.
    tm.dm.check_and_publish_smh(&[0; 32], 0, &[]).unwrap();
    let smh = tm.client.get_and_verify_smh().await.unwrap();
    assert_eq!(smh.head.map_size, 0);
}

// One log, one certificate for example-1.com: the published proofs rebuild
// both the domain-tree root and the sparse-tree root.
#[tokio::test]
async fn single_certificate_roundtrip() {
    let tm = start_test_map().await;

    tm.transactions
        .send(transaction(0, 1, &[("example-1.com", &[0])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 1).await;

    let smh = tm.client.get_and_verify_smh().await.unwrap();
    assert_eq!(smh.head.map_size, 1);
    assert_eq!(smh.head.source_log_revisions.len(), 1);
    assert_eq!(smh.head.source_log_revisions[0].tree_size, 1);
    assert_eq!(smh.head.source_log_revisions[0].root_hash, [0xa0; 32]);

    let root_resp = tm
        .client
        .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
            domain_name: "example-1.com".to_string(),
            domain_map_size: 1,
        })
        .await
        .unwrap();
    assert_eq!(root_resp.domain_tree_size, 1);
    assert_eq!(root_resp.normalized_domain_name, "example-1.com");

    // Domain-tree inclusion: the leaf encoding of (0, 0) against the
    // domain-tree root.
    let entry_resp = tm
        .client
        .get_entry_and_proof(&GetEntryAndProofRequest {
            domain_name: "example-1.com".to_string(),
            index: 0,
            domain_tree_size: 1,
        })
        .await
        .unwrap();
    assert_eq!(entry_resp.entry, [0, 0]);
    let leaf = DomainTreeEntry { log_index: 0, cert_index: 0 };
    assert!(merkle::verify_inclusion(
        &merkle::leaf_hash(&leaf.encode()),
        0,
        1,
        &entry_resp.audit_path,
        &root_resp.domain_tree_root_hash,
    ));

    // Sparse-tree membership: the domain root value against the map root.
    let value = DomainTreeRoot {
        domain_tree_size: root_resp.domain_tree_size,
        domain_tree_root_hash: root_resp.domain_tree_root_hash,
    }
    .encode();
    assert!(smt::verify_proof(
        &root_resp.audit_path,
        &root_resp.leaf_hash,
        b"example-1.com",
        Some(&value),
        &smh.head.map_root_hash,
    ));

    // The aux index answers the reverse lookup.
    let index_resp = tm
        .client
        .get_domain_tree_index(&GetDomainTreeIndexRequest {
            domain_name: "example-1.com".to_string(),
            log_index: 0,
            certificate_index: 0,
        })
        .await
        .unwrap();
    assert_eq!(index_resp.domain_tree_index, 0);

    // The source tree lists the log.
    let logs = tm
        .client
        .get_source_logs(&GetSourceLogsRequest { start: 0, end: 0 })
        .await
        .unwrap();
    assert_eq!(logs.log_ids, vec![[1u8; 32]]);
}

// A second batch at CT indices 1 and 3 grows the domain tree to 3 leaves
// and the map size to 3; historical snapshots stay consistent.
#[tokio::test]
async fn second_batch_and_consistency() {
    let tm = start_test_map().await;

    tm.transactions
        .send(transaction(0, 1, &[("example-1.com", &[0])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 1).await;

    // Deliberately unsorted indices: the worker sorts before appending.
    tm.transactions
        .send(transaction(0, 3, &[("example-1.com", &[3, 1])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 3).await;

    let smh = tm.client.get_and_verify_smh().await.unwrap();
    assert_eq!(smh.head.map_size, 3);

    let root_resp = tm
        .client
        .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
            domain_name: "example-1.com".to_string(),
            domain_map_size: 3,
        })
        .await
        .unwrap();
    assert_eq!(root_resp.domain_tree_size, 3);

    let entries = tm
        .client
        .get_entries(&GetEntriesRequest {
            domain_name: "example-1.com".to_string(),
            start: 0,
            end: 2,
        })
        .await
        .unwrap();
    assert_eq!(entries.entries, vec![[0, 0], [0, 1], [0, 3]]);

    // Audit path for leaf index 1 at size 3.
    let entry_resp = tm
        .client
        .get_entry_and_proof(&GetEntryAndProofRequest {
            domain_name: "example-1.com".to_string(),
            index: 1,
            domain_tree_size: 3,
        })
        .await
        .unwrap();
    let leaf = DomainTreeEntry { log_index: 0, cert_index: 1 };
    assert!(merkle::verify_inclusion(
        &merkle::leaf_hash(&leaf.encode()),
        1,
        3,
        &entry_resp.audit_path,
        &root_resp.domain_tree_root_hash,
    ));

    // Consistency between the size-1 and size-3 domain trees, with the old
    // root read from the historical SMH snapshot.
    let old_root_resp = tm
        .client
        .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
            domain_name: "example-1.com".to_string(),
            domain_map_size: 1,
        })
        .await
        .unwrap();
    assert_eq!(old_root_resp.domain_tree_size, 1);

    let proof = tm
        .client
        .get_consistency_proof(&GetConsistencyProofRequest {
            domain_name: "example-1.com".to_string(),
            first: 1,
            second: 3,
        })
        .await
        .unwrap();
    assert!(merkle::verify_consistency(
        1,
        3,
        &proof.proof,
        &old_root_resp.domain_tree_root_hash,
        &root_resp.domain_tree_root_hash,
    ));
}

// A transaction for log 1 delivered before log 0 ever arrived is buffered
// and applied once log 0 lands.
#[tokio::test]
async fn out_of_order_logs_are_absorbed() {
    let tm = start_test_map().await;

    tm.transactions
        .send(transaction(1, 2, &[("example-2.com", &[0, 1])]))
        .await
        .unwrap();
    // Give the worker a moment: nothing may be published for log 1 alone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tm.dm.get_latest_smh().head.map_size, 0);

    tm.transactions
        .send(transaction(0, 1, &[("example-1.com", &[0])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 3).await;

    let smh = tm.client.get_and_verify_smh().await.unwrap();
    assert_eq!(smh.head.source_log_revisions.len(), 2);
    assert_eq!(smh.head.source_log_revisions[0].tree_size, 1);
    assert_eq!(smh.head.source_log_revisions[1].tree_size, 2);

    // The source tree records the logs in index order.
    let logs = tm
        .client
        .get_source_logs(&GetSourceLogsRequest { start: 0, end: 1 })
        .await
        .unwrap();
    assert_eq!(logs.log_ids, vec![[1u8; 32], [2u8; 32]]);

    // And the source-tree proofs verify.
    let log_resp = tm
        .client
        .get_source_log_and_proof(&GetSourceLogAndProofRequest { index: 1, source_tree_size: 2 })
        .await
        .unwrap();
    assert_eq!(log_resp.log_id, [2u8; 32]);
    assert!(merkle::verify_inclusion(
        &merkle::leaf_hash(&log_resp.log_id),
        1,
        2,
        &log_resp.audit_path,
        &smh.head.source_tree_root_hash,
    ));

    let source_consistency = tm
        .client
        .get_source_consistency_proof(&GetSourceConsistencyProofRequest { first: 1, second: 2 })
        .await
        .unwrap();
    let first_root = tm.dm.source_tree().get_root(1).unwrap();
    assert!(merkle::verify_consistency(
        1,
        2,
        &source_consistency.proof,
        &first_root,
        &smh.head.source_tree_root_hash,
    ));
}

// After the MMD fires with no new transactions, a fresh SMH appears with an
// identical head apart from a strictly newer timestamp.
#[tokio::test]
async fn mmd_republish() {
    let tm = start_test_map().await;

    tm.transactions
        .send(transaction(0, 1, &[("example-1.com", &[0])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 1).await;
    let first = tm.client.get_and_verify_smh().await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let smh = tm.client.get_and_verify_smh().await.unwrap();
            if smh.head.timestamp > first.head.timestamp {
                return smh;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("timed out waiting for a republished SMH");

    assert_eq!(second.head.map_size, first.head.map_size);
    assert_eq!(second.head.map_root_hash, first.head.map_root_hash);
    assert_eq!(second.head.source_tree_root_hash, first.head.source_tree_root_hash);
    assert_eq!(second.head.source_log_revisions, first.head.source_log_revisions);
}

// Non-membership: a domain that was never inserted yields a proof that
// recomputes the published map root from the placeholder leaf.
#[tokio::test]
async fn non_membership_proof() {
    let tm = start_test_map().await;

    tm.transactions
        .send(transaction(0, 2, &[("example-1.com", &[0]), ("example-2.com", &[1])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 2).await;
    let smh = tm.client.get_and_verify_smh().await.unwrap();

    let resp = tm
        .client
        .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
            domain_name: "does-not-exist.invalid".to_string(),
            domain_map_size: 2,
        })
        .await
        .unwrap();
    assert_eq!(resp.domain_tree_size, 0);
    assert_eq!(resp.domain_tree_root_hash, merkle::empty_root());

    assert!(smt::verify_proof(
        &resp.audit_path,
        &resp.leaf_hash,
        b"does-not-exist.invalid",
        None,
        &smh.head.map_root_hash,
    ));
}

// Validation errors surface as 404s with a description.
#[tokio::test]
async fn error_responses() {
    let tm = start_test_map().await;
    tm.transactions
        .send(transaction(0, 1, &[("example-1.com", &[0])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 1).await;

    // Unknown snapshot.
    let err = tm
        .client
        .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
            domain_name: "example-1.com".to_string(),
            domain_map_size: 99,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));

    // Reversed range.
    let err = tm
        .client
        .get_consistency_proof(&GetConsistencyProofRequest {
            domain_name: "example-1.com".to_string(),
            first: 3,
            second: 1,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));

    // Range beyond the tree size.
    let err = tm
        .client
        .get_entries(&GetEntriesRequest {
            domain_name: "example-1.com".to_string(),
            start: 0,
            end: 5,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));

    // Unknown domain for tree-backed endpoints.
    let err = tm
        .client
        .get_entries(&GetEntriesRequest {
            domain_name: "unknown.example".to_string(),
            start: 0,
            end: 0,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));
}

// Snapshot isolation over the HTTP surface: the proofs served for an old
// map size keep verifying after later publishes.
#[tokio::test]
async fn historical_snapshots_stay_valid() {
    let tm = start_test_map().await;

    tm.transactions
        .send(transaction(0, 1, &[("example-1.com", &[0])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 1).await;
    let smh1 = tm.client.get_and_verify_smh().await.unwrap();

    tm.transactions
        .send(transaction(0, 5, &[("example-1.com", &[2, 4]), ("example-3.com", &[3])]))
        .await
        .unwrap();
    wait_for_map_size(&tm.dm, 5).await;

    let resp = tm
        .client
        .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
            domain_name: "example-1.com".to_string(),
            domain_map_size: 1,
        })
        .await
        .unwrap();
    assert_eq!(resp.domain_tree_size, 1);
    let value = DomainTreeRoot {
        domain_tree_size: 1,
        domain_tree_root_hash: resp.domain_tree_root_hash,
    }
    .encode();
    assert!(smt::verify_proof(
        &resp.audit_path,
        &resp.leaf_hash,
        b"example-1.com",
        Some(&value),
        &smh1.head.map_root_hash,
    ));
}
