//! Legacy ACL migration against a file-backed database

mod common;

use acld::acl::{AclProperties, AclType};
use acld::Config;
use common::{allow, AclTest};

fn file_config(dir: &tempfile::TempDir) -> Config {
    Config {
        db_path: Some(dir.path().join("acld.db").to_string_lossy().into_owned()),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_patch_converts_legacy_tree_once() {
    let dir = tempfile::tempdir().unwrap();

    let setup = AclTest::with_config(file_config(&dir))
        .await
        .expect("Failed to start harness");
    let mut txn = setup.txn().await;
    let tree = setup
        .build_tree(&mut txn, "SpacesStore", &["a", "a/b", "a/b/c", "d"])
        .await
        .unwrap();
    let old = setup
        .engine
        .create_acl(
            &mut txn,
            AclProperties::new(AclType::Old),
            &[allow("alice", "Read")],
            None,
        )
        .await
        .unwrap();
    setup
        .nodes
        .set_node_acl_id(&mut txn, tree.id("a/b"), Some(old.id))
        .await
        .unwrap();
    txn.commit().await.unwrap();

    // A second server on the same file sees the committed tree
    let t = AclTest::with_config(file_config(&dir))
        .await
        .expect("Failed to reopen database");
    let perms = t.permissions();

    let mut txn = t.txn().await;
    let counters = perms.patch_acls(&mut txn).await.unwrap();
    txn.commit().await.unwrap();
    // Root plus the converted OLD ACL
    assert_eq!(counters.get(AclType::Defining), 2);
    // a and d under the root, c under the converted node
    assert_eq!(counters.get(AclType::Shared), 3);
    assert_eq!(counters.get(AclType::Old), 0);

    let mut txn = t.txn().await;
    let b = perms
        .get_node_acl(&mut txn, tree.node("a/b"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.properties.acl_type, AclType::Defining);
    assert_eq!(b.positions_of("alice", "Read"), vec![0]);

    let readers = perms.get_readers(&mut txn, tree.node("a/b/c")).await.unwrap();
    assert!(readers.contains("alice"));
    txn.commit().await.unwrap();

    let paths = ["", "a", "a/b", "a/b/c", "d"];
    let mut txn = t.txn().await;
    let mut before = Vec::new();
    for path in paths {
        before.push(t.nodes.get_node_acl_id(&mut txn, tree.id(path)).await.unwrap());
    }
    let again = perms.patch_acls(&mut txn).await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(again.total(), 0);

    // The second run leaves every node on the ACL the first run gave it
    let mut txn = t.txn().await;
    for (path, expected) in paths.iter().zip(before) {
        let acl = t.nodes.get_node_acl_id(&mut txn, tree.id(path)).await.unwrap();
        assert!(acl.is_some(), "{path:?} lost its ACL");
        assert_eq!(acl, expected, "{path:?} moved to another ACL");
    }
    txn.commit().await.unwrap();
}
