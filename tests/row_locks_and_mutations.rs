use regionserver::RegionServer;
use regionserver::config::RegionServerConfig;
use regionserver::error::{ErrorCode, RegionServerError, SessionKind};
use regionserver::mutation::{CellCheck, Increment};
use regionserver::region::{RegionInfo, TableDescriptor, derive_region_boundaries};
use regionserver::storage::{Delete, Get, Put, RowMutation, RowMutations};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

fn accounts() -> TableDescriptor {
    TableDescriptor::new("accounts").with_family("b")
}

async fn serve(config: RegionServerConfig) -> (TempDir, Arc<RegionServer>, String) {
    let dir = tempdir().expect("tempdir");
    let server = RegionServer::open_local(dir.path(), config).expect("open");
    let regions: Vec<RegionInfo> = derive_region_boundaries(&accounts(), &[]).expect("bounds");
    server
        .lifecycle()
        .create_regions(&accounts(), &regions, None)
        .expect("create");
    server
        .open_region(&accounts(), &regions[0])
        .expect("open region");
    (dir, server, regions[0].region_name())
}

fn balance(server: &RegionServer, region: &str, row: &str) -> Option<Vec<u8>> {
    server
        .get(region, &Get::new(row))
        .expect("get")
        .and_then(|r| r.value(b"b", b"v").map(<[u8]>::to_vec))
}

#[tokio::test]
async fn row_lock_excludes_other_writers_until_released() {
    let config = RegionServerConfig::development().with_row_lock_wait_ms(30);
    let (_dir, server, region) = serve(config).await;
    let lock = server.lock_row(&region, b"alice").expect("lock");

    let err = server.lock_row(&region, b"alice").expect_err("second lock");
    assert_eq!(err.code(), ErrorCode::RowBusy);

    let started = Instant::now();
    let err = server
        .put(&region, Put::new("alice").add("b", "v", "1"))
        .expect_err("unlocked writer waits then gives up");
    assert_eq!(err.code(), ErrorCode::RowBusy);
    assert!(started.elapsed() >= Duration::from_millis(30));

    server
        .put(&region, Put::new("alice").add("b", "v", "2").with_lock(lock))
        .expect("holder writes");
    server
        .put(&region, Put::new("bob").add("b", "v", "9"))
        .expect("other rows are free");

    server.unlock_row(&region, lock).expect("unlock");
    assert!(matches!(
        server.unlock_row(&region, lock),
        Err(RegionServerError::UnknownSession {
            kind: SessionKind::RowLock,
            ..
        })
    ));
    server
        .put(&region, Put::new("alice").add("b", "v", "3"))
        .expect("free after unlock");
    assert_eq!(balance(&server, &region, "alice"), Some(b"3".to_vec()));
}

#[tokio::test]
async fn lock_id_for_another_row_is_rejected() {
    let (_dir, server, region) = serve(RegionServerConfig::development()).await;
    let lock = server.lock_row(&region, b"alice").expect("lock");
    let err = server
        .put(&region, Put::new("bob").add("b", "v", "1").with_lock(lock))
        .expect_err("wrong row");
    assert_eq!(err.code(), ErrorCode::UnknownSession);
    assert!(matches!(
        server.put(&region, Put::new("x").add("b", "v", "1").with_lock(424242)),
        Err(RegionServerError::UnknownSession { .. })
    ));
}

#[tokio::test]
async fn abandoned_row_lock_expires_and_frees_the_row() {
    let config = RegionServerConfig::development().with_row_lock_lease_ms(100);
    let (_dir, server, region) = serve(config).await;
    let lock = server.lock_row(&region, b"carol").expect("lock");
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(matches!(
        server.unlock_row(&region, lock),
        Err(RegionServerError::UnknownSession { .. })
    ));
    let again = server.lock_row(&region, b"carol").expect("row freed");
    assert_ne!(again, lock);
    server.unlock_row(&region, again).expect("unlock");
}

#[tokio::test]
async fn check_and_put_and_check_and_delete() {
    let (_dir, server, region) = serve(RegionServerConfig::development()).await;
    assert!(
        server
            .check_and_put(
                &region,
                &CellCheck::absent("dave", "b", "v"),
                Put::new("dave").add("b", "v", "10"),
            )
            .expect("create")
    );
    assert!(
        !server
            .check_and_put(
                &region,
                &CellCheck::equals("dave", "b", "v", "11"),
                Put::new("dave").add("b", "v", "12"),
            )
            .expect("stale expectation")
    );
    assert!(
        !server
            .check_and_delete(
                &region,
                &CellCheck::equals("dave", "b", "v", "99"),
                Delete::new("dave"),
            )
            .expect("stale delete")
    );
    assert_eq!(balance(&server, &region, "dave"), Some(b"10".to_vec()));
    assert!(
        server
            .check_and_delete(
                &region,
                &CellCheck::equals("dave", "b", "v", "10"),
                Delete::new("dave"),
            )
            .expect("delete")
    );
    assert!(!server.exists(&region, &Get::new("dave")).expect("exists"));
}

#[tokio::test]
async fn racing_compare_and_swaps_lose_no_update() {
    let (_dir, server, region) = serve(RegionServerConfig::development()).await;
    server
        .put(&region, Put::new("counter").add("b", "v", "0"))
        .expect("seed");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let server = Arc::clone(&server);
        let region = region.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let mut applied = 0;
            while applied < 10 {
                let current = balance(&server, &region, "counter").expect("value");
                let next: u32 = String::from_utf8_lossy(&current).parse::<u32>().expect("number") + 1;
                let swapped = server
                    .check_and_put(
                        &region,
                        &CellCheck::equals("counter", "b", "v", current),
                        Put::new("counter").add("b", "v", next.to_string()),
                    )
                    .expect("check and put");
                if swapped {
                    applied += 1;
                }
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }
    assert_eq!(balance(&server, &region, "counter"), Some(b"80".to_vec()));
}

#[tokio::test]
async fn increments_accumulate_under_contention() {
    let (_dir, server, region) = serve(RegionServerConfig::development()).await;
    let mut tasks = Vec::new();
    for _ in 0..6 {
        let server = Arc::clone(&server);
        let region = region.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for _ in 0..50 {
                server
                    .increment_column_value(&region, &Increment::new("hits", "b", "n", 2))
                    .expect("increment");
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }
    let total = server
        .increment_column_value(&region, &Increment::new("hits", "b", "n", -100))
        .expect("decrement");
    assert_eq!(total, 500);

    let lock = server.lock_row(&region, b"hits").expect("lock");
    let total = server
        .increment_column_value(&region, &Increment::new("hits", "b", "n", 1).with_lock(lock))
        .expect("locked increment");
    assert_eq!(total, 501);
    server.unlock_row(&region, lock).expect("unlock");

    server
        .put(&region, Put::new("name").add("b", "n", "text"))
        .expect("seed");
    let err = server
        .increment_column_value(&region, &Increment::new("name", "b", "n", 1))
        .expect_err("not a counter");
    assert_eq!(err.code(), ErrorCode::TypeMismatch);
}

#[tokio::test]
async fn mutate_row_is_all_or_nothing_for_the_row() {
    let (_dir, server, region) = serve(RegionServerConfig::development()).await;
    server
        .put(&region, Put::new("erin").add("b", "v", "5").add("b", "old", "x"))
        .expect("seed");
    let edit = RowMutations::new("erin")
        .add(RowMutation::Put(Put::new("erin").add("b", "v", "6")))
        .add(RowMutation::Delete(Delete::new("erin").column("b", "old")));
    server.mutate_row(&region, &edit).expect("mutate row");
    let row = server
        .get(&region, &Get::new("erin"))
        .expect("get")
        .expect("row");
    assert_eq!(row.cells.len(), 1);
    assert_eq!(row.value(b"b", b"v"), Some(&b"6"[..]));

    assert!(matches!(
        server.mutate_row(&region, &RowMutations::new("erin")),
        Err(RegionServerError::InvalidRequest(_))
    ));
    let bad_family = RowMutations::new("erin")
        .add(RowMutation::Put(Put::new("erin").add("nope", "v", "7")));
    assert!(server.mutate_row(&region, &bad_family).is_err());
    assert_eq!(balance(&server, &region, "erin"), Some(b"6".to_vec()));
}

#[tokio::test]
async fn batch_puts_and_deletes_report_failures() {
    let (_dir, server, region) = serve(RegionServerConfig::development()).await;
    let puts = vec![
        Put::new("a").add("b", "v", "1"),
        Put::new("b").add("missing", "v", "1"),
        Put::new("c").add("b", "v", "1"),
    ];
    assert_eq!(server.put_batch(&region, &puts).expect("batch"), 1);
    assert_eq!(
        server
            .put_batch(&region, &[Put::new("d").add("b", "v", "1")])
            .expect("batch"),
        -1
    );
    let found = server
        .get_batch(&region, &[Get::new("a"), Get::new("b"), Get::new("d")])
        .expect("gets");
    assert_eq!(
        found.iter().map(Option::is_some).collect::<Vec<_>>(),
        [true, false, true]
    );
    assert_eq!(
        server
            .delete_batch(&region, &[Delete::new("a"), Delete::new("c")])
            .expect("deletes"),
        -1
    );
    assert!(!server.exists(&region, &Get::new("a")).expect("exists"));
}
