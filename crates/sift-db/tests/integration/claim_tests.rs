use std::collections::HashSet;

use chrono::Utc;
use sift_core::traits::ArticleRepository;
use sift_db::PgArticleRepository;
use uuid::Uuid;

use crate::integration::common::{candidate, raw_message, setup_test_db};

async fn seed(repo: &PgArticleRepository, n: usize) {
    let (email, _) = repo.store_email(&raw_message("seed", Utc::now())).await.unwrap();
    let candidates: Vec<_> = (0..n)
        .map(|i| candidate(&format!("https://x.test/{i}")))
        .collect();
    let stored = repo.store_articles(&email, &candidates).await.unwrap();
    assert_eq!(stored.inserted, n);
}

#[tokio::test]
async fn claim_respects_limit_and_order() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgArticleRepository::new(pool);
    seed(&repo, 5).await;

    let first = repo.claim_pending(3).await.unwrap();
    let second = repo.claim_pending(3).await.unwrap();
    let third = repo.claim_pending(3).await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 2);
    assert!(third.is_empty());
    assert!(first.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert!(repo.claim_pending(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_partition_pending_set() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgArticleRepository::new(pool);
    seed(&repo, 40).await;

    let claims = (0..6).map(|_| {
        let repo = repo.clone();
        async move {
            let mut mine = Vec::new();
            loop {
                let batch = repo.claim_pending(3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|a| a.id));
            }
            mine
        }
    });
    let results: Vec<Vec<Uuid>> = futures::future::join_all(claims).await;

    let total: usize = results.iter().map(Vec::len).sum();
    let unique: HashSet<Uuid> = results.into_iter().flatten().collect();

    assert_eq!(total, 40);
    assert_eq!(unique.len(), 40);
}
