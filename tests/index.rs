//! Index durability and lease-safety integration tests.

use std::time::Duration;

use tempfile::TempDir;

use reelvault::index::{Index, IndexError, IndexOptions, Item, Status};

fn fast_opts() -> IndexOptions {
    IndexOptions {
        lease_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
        retry_delay: Duration::from_millis(10),
        max_attempts: 3,
    }
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn second_open_fails_while_the_index_is_held() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.db");

    let index = Index::open(&path, IndexOptions::default()).await.unwrap();

    let err = match Index::open(&path, IndexOptions::default()).await {
        Err(err) => err,
        Ok(_) => panic!("second open must fail"),
    };
    assert!(matches!(err, IndexError::AlreadyOpen));
    assert!(err.to_string().contains("locked"));

    // Releasing the first instance makes the database available again.
    index.close().await.unwrap();
    drop(index);
    let reopened = Index::open(&path, IndexOptions::default()).await.unwrap();
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn torn_trailing_record_is_discarded_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.db");

    {
        let index = Index::open(&path, IndexOptions::default()).await.unwrap();
        index.push(&ids(&["VIDEOAAAAAA", "VIDEOBBBBBB"])).await.unwrap();
        index.close().await.unwrap();
    }

    // Simulate a crash mid-append: a record cut off without a newline.
    let mut data = std::fs::read_to_string(&path).unwrap();
    data.push_str(r#"{"items":[{"id":"VIDEOCCCCCC","st"#);
    std::fs::write(&path, data).unwrap();

    let index = Index::open(&path, IndexOptions::default()).await.unwrap();
    let all = index.dump().await;
    let got: Vec<&str> = all.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(got, vec!["VIDEOAAAAAA", "VIDEOBBBBBB"]);
    index.check().await.unwrap();

    // The log is writable again after the torn tail.
    index.push(&ids(&["VIDEOCCCCCC"])).await.unwrap();
    index.close().await.unwrap();
}

#[tokio::test]
async fn corrupt_interior_record_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.db");

    {
        let index = Index::open(&path, IndexOptions::default()).await.unwrap();
        index.push(&ids(&["VIDEOAAAAAA"])).await.unwrap();
        index.close().await.unwrap();
    }

    let mut data = std::fs::read_to_string(&path).unwrap();
    data = format!("not json at all\n{}", data);
    std::fs::write(&path, data).unwrap();

    let err = match Index::open(&path, IndexOptions::default()).await {
        Err(err) => err,
        Ok(_) => panic!("corrupt log must not open"),
    };
    assert!(matches!(err, IndexError::Corrupt(_)));
}

#[tokio::test]
async fn every_pushed_id_is_popped_exactly_once() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), IndexOptions::default())
        .await
        .unwrap();

    let all: Vec<String> = (0..20).map(|i| format!("VIDEO{:06}", i)).collect();
    assert_eq!(index.push(&all).await.unwrap(), all.len());

    let mut queued = index.get(Status::New, all.len()).await.unwrap();
    for item in &mut queued {
        item.status = Status::Enqueued;
    }
    index.put(queued).await.unwrap();

    let mut seen = std::collections::HashSet::new();
    loop {
        let popped = index.pop(3).await.unwrap();
        if popped.is_empty() {
            break;
        }
        for item in popped {
            assert_eq!(item.status, Status::InProgress);
            assert!(seen.insert(item.id.clone()), "{} popped twice", item.id);
        }
    }
    assert_eq!(seen.len(), all.len());

    index.check().await.unwrap();
    index.close().await.unwrap();
}

#[tokio::test]
async fn expired_lease_returns_to_the_queue() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();

    let mut item = Item::new("VIDEOAAAAAA");
    item.status = Status::Enqueued;
    index.put(vec![item]).await.unwrap();

    assert_eq!(index.pop(1).await.unwrap().len(), 1);
    assert!(index.pop(1).await.unwrap().is_empty());

    // Lease timeout plus a few sweep ticks.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let popped = index.pop(1).await.unwrap();
    assert_eq!(popped.len(), 1, "reclaimed item must be poppable again");
    assert_eq!(popped[0].id, "VIDEOAAAAAA");

    index.close().await.unwrap();
}

#[tokio::test]
async fn a_beating_holder_is_never_reclaimed() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(dir.path().join("index.db"), fast_opts())
        .await
        .unwrap();

    let mut item = Item::new("VIDEOAAAAAA");
    item.status = Status::Enqueued;
    index.put(vec![item]).await.unwrap();
    index.pop(1).await.unwrap();

    // Beat at a third of the lease timeout for several lease periods.
    for _ in 0..15 {
        index.beat("VIDEOAAAAAA");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let all = index.dump().await;
        assert_eq!(all[0].status, Status::InProgress);
    }

    index.close().await.unwrap();
}

#[tokio::test]
async fn oversized_log_is_compacted_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.db");

    {
        let index = Index::open(&path, IndexOptions::default()).await.unwrap();
        index.push(&ids(&["VIDEOAAAAAA"])).await.unwrap();

        // Churn a single item through far more transactions than there are
        // live items.
        for i in 0..1100u32 {
            let mut item = Item::new("VIDEOAAAAAA");
            item.status = if i % 2 == 0 {
                Status::Enqueued
            } else {
                Status::New
            };
            index.put(vec![item]).await.unwrap();
        }
        index.close().await.unwrap();
    }

    let before = std::fs::read_to_string(&path).unwrap().lines().count();
    assert!(before > 1000);

    let index = Index::open(&path, IndexOptions::default()).await.unwrap();
    let all = index.dump().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "VIDEOAAAAAA");
    index.check().await.unwrap();
    index.close().await.unwrap();

    let after = std::fs::read_to_string(&path).unwrap().lines().count();
    assert!(after < 10, "log should have been rewritten, got {} lines", after);
}
