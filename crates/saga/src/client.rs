//! In-process implementation of the order service's calls into the
//! user service.

use async_trait::async_trait;
use common::UserId;
use order::{ClientError, CompanionInfo, UserClient};
use wallet::{CompanionService, UserStore, WalletError, WalletService};

fn remote(e: WalletError) -> ClientError {
    ClientError::new(e.code(), e.to_string())
}

/// Calls the wallet and companion services directly, with the same error
/// codes a remote user service would return.
#[derive(Clone)]
pub struct LocalUserClient<S> {
    wallet: WalletService<S>,
    companions: CompanionService<S>,
}

impl<S: UserStore + Clone> LocalUserClient<S> {
    pub fn new(store: S) -> Self {
        Self {
            wallet: WalletService::new(store.clone()),
            companions: CompanionService::new(store),
        }
    }
}

#[async_trait]
impl<S: UserStore + Clone + 'static> UserClient for LocalUserClient<S> {
    async fn get_companion(&self, user_id: UserId) -> Result<CompanionInfo, ClientError> {
        let profile = self.companions.get_companion(user_id).await.map_err(remote)?;
        Ok(CompanionInfo {
            user_id: profile.user_id,
            price_per_hour: profile.price_per_hour,
            status: profile.status.code(),
        })
    }

    async fn get_balance(&self, user_id: UserId) -> Result<i64, ClientError> {
        let wallet = self.wallet.get_wallet(user_id).await.map_err(remote)?;
        Ok(wallet.balance)
    }

    async fn consume(&self, user_id: UserId, amount: i64, biz_order_id: &str, remark: &str) -> Result<(), ClientError> {
        self.wallet
            .consume(user_id, amount, biz_order_id, remark)
            .await
            .map(|_| ())
            .map_err(remote)
    }

    async fn update_companion_status(&self, user_id: UserId, status: i16) -> Result<(), ClientError> {
        self.companions
            .update_companion_status(user_id, status)
            .await
            .map(|_| ())
            .map_err(remote)
    }

    async fn update_companion_stats(&self, user_id: UserId, rating: f64, delta_orders: i64) -> Result<(), ClientError> {
        self.companions
            .update_companion_stats(user_id, rating, delta_orders)
            .await
            .map(|_| ())
            .map_err(remote)
    }
}
