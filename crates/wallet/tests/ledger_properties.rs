//! Ledger invariants under concurrency and replay.
//!
//! These run against the in-memory store; `postgres_wallet.rs` covers the
//! same rules on a real database.

use std::sync::Arc;

use common::{ErrorCode, UserId};
use wallet::{InMemoryUserStore, TransactionKind, UserStore, WalletService};

fn create_service() -> WalletService<InMemoryUserStore> {
    WalletService::new(InMemoryUserStore::new())
}

const BOSS: UserId = UserId::new(1001);

mod idempotency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_apply_once() {
        let wallet = Arc::new(create_service());
        wallet.recharge(BOSS, 1_000, "seed", "").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let wallet = wallet.clone();
            handles.push(tokio::spawn(async move { wallet.consume(BOSS, 300, "BIZ-1", "").await }));
        }

        let mut applied = 0;
        for handle in handles {
            let update = handle.await.unwrap().unwrap();
            if !update.replayed {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(wallet.get_wallet(BOSS).await.unwrap().balance, 700);
        let consumes = wallet
            .list_transactions(BOSS)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Consume)
            .count();
        assert_eq!(consumes, 1);
    }

    #[tokio::test]
    async fn replay_after_later_changes_returns_current_wallet() {
        let wallet = create_service();
        wallet.recharge(BOSS, 1_000, "seed", "").await.unwrap();
        let first = wallet.consume(BOSS, 300, "BIZ-1", "").await.unwrap();
        wallet.consume(BOSS, 200, "BIZ-2", "").await.unwrap();

        let replay = wallet.consume(BOSS, 300, "BIZ-1", "").await.unwrap();

        assert!(replay.replayed);
        assert_eq!(replay.transaction, first.transaction);
        assert_eq!(replay.wallet.balance, 500);
    }
}

mod conservation {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn balance_equals_sum_of_ledger() {
        let wallet = Arc::new(create_service());
        wallet.recharge(BOSS, 500, "seed", "").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let wallet = wallet.clone();
            handles.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    wallet.recharge(BOSS, 70, &format!("r-{i}"), "").await
                } else {
                    wallet.consume(BOSS, 50, &format!("c-{i}"), "").await
                }
            }));
        }
        for handle in handles {
            // Some consumes are refused for lack of funds; that is fine here.
            let _ = handle.await.unwrap();
        }

        let balance = wallet.get_wallet(BOSS).await.unwrap().balance;
        let ledger = wallet.list_transactions(BOSS).await.unwrap();
        let sum: i64 = ledger.iter().map(|t| t.change_amount).sum();

        assert_eq!(balance, sum);
        assert!(balance >= 0);
        for row in &ledger {
            assert_eq!(row.after_balance, row.before_balance + row.change_amount);
            assert!(row.after_balance >= 0);
        }
    }

    #[tokio::test]
    async fn ledger_rows_chain_in_order() {
        let wallet = create_service();
        wallet.recharge(BOSS, 100, "r-1", "").await.unwrap();
        wallet.consume(BOSS, 40, "c-1", "").await.unwrap();
        wallet.refund(BOSS, 40, "c-1", "").await.unwrap();

        let ledger = wallet.list_transactions(BOSS).await.unwrap();

        for pair in ledger.windows(2) {
            assert_eq!(pair[0].after_balance, pair[1].before_balance);
        }
        assert_eq!(ledger.last().unwrap().after_balance, 100);
    }
}

mod no_overdraft {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_never_overdraw() {
        let wallet = Arc::new(create_service());
        wallet.recharge(BOSS, 1_000, "seed", "").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let wallet = wallet.clone();
            handles.push(tokio::spawn(async move { wallet.consume(BOSS, 100, &format!("c-{i}"), "").await }));
        }

        let mut ok = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert_eq!(e.code(), ErrorCode::ResourceExhausted);
                    exhausted += 1;
                }
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(exhausted, 10);
        assert_eq!(wallet.get_wallet(BOSS).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn frozen_balance_is_untouched() {
        let wallet = create_service();
        wallet.recharge(BOSS, 100, "r-1", "").await.unwrap();
        wallet.consume(BOSS, 30, "c-1", "").await.unwrap();

        let stored = wallet.store().find_wallet(BOSS).await.unwrap().unwrap();

        assert_eq!(stored.frozen_balance, 0);
    }
}
