use common::UserId;

use crate::error::{Result, WalletError};
use crate::model::{CompanionProfile, CompanionStatus, UserStats};
use crate::service::rollback_quietly;
use crate::store::{UserStore, UserTx};

/// Companion profiles and follow counters.
#[derive(Clone)]
pub struct CompanionService<S> {
    store: S,
}

impl<S: UserStore> CompanionService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Creates a profile or updates the price (and, if given, the status)
    /// of an existing one. Rating and order count are preserved.
    #[tracing::instrument(skip(self))]
    pub async fn upsert_companion(
        &self,
        user_id: UserId,
        price_per_hour: i64,
        status: Option<CompanionStatus>,
    ) -> Result<CompanionProfile> {
        if user_id.is_zero() {
            return Err(WalletError::InvalidArgument("user_id is required"));
        }
        if price_per_hour <= 0 {
            return Err(WalletError::InvalidArgument("price_per_hour must be positive"));
        }

        self.modify(user_id, true, |profile| {
            profile.price_per_hour = price_per_hour;
            if let Some(status) = status {
                profile.status = status;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_companion(&self, user_id: UserId) -> Result<CompanionProfile> {
        self.store
            .find_companion(user_id)
            .await?
            .ok_or(WalletError::NotFound("companion"))
    }

    /// Sets availability from its wire code: 0 offline, 1 online, 2 busy.
    #[tracing::instrument(skip(self))]
    pub async fn update_companion_status(&self, user_id: UserId, status: i16) -> Result<CompanionProfile> {
        let status = CompanionStatus::from_code(status).ok_or(WalletError::InvalidArgument("invalid companion status"))?;
        let profile = self
            .modify(user_id, false, |profile| {
                profile.status = status;
                Ok(())
            })
            .await?;
        tracing::info!(status = ?profile.status, "companion status updated");
        Ok(profile)
    }

    /// Folds a rating for `delta_orders` finished orders into the profile.
    #[tracing::instrument(skip(self))]
    pub async fn update_companion_stats(&self, user_id: UserId, rating: f64, delta_orders: i64) -> Result<CompanionProfile> {
        if !(0.0..=5.0).contains(&rating) {
            return Err(WalletError::InvalidArgument("rating must be between 0 and 5"));
        }
        if delta_orders <= 0 {
            return Err(WalletError::InvalidArgument("delta_orders must be positive"));
        }
        self.modify(user_id, false, |profile| {
            profile.record_rating(rating, delta_orders);
            Ok(())
        })
        .await
    }

    pub async fn get_user_stats(&self, user_id: UserId) -> Result<UserStats> {
        Ok(self.store.find_stats(user_id).await?)
    }

    async fn modify<F>(&self, user_id: UserId, create: bool, f: F) -> Result<CompanionProfile>
    where
        F: FnOnce(&mut CompanionProfile) -> Result<()> + Send,
    {
        let mut tx = self.store.begin().await?;
        match Self::modify_in(tx.as_mut(), user_id, create, f).await {
            Ok(profile) => {
                tx.commit().await?;
                Ok(profile)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn modify_in<F>(tx: &mut dyn UserTx, user_id: UserId, create: bool, f: F) -> Result<CompanionProfile>
    where
        F: FnOnce(&mut CompanionProfile) -> Result<()> + Send,
    {
        let mut profile = match tx.lock_companion(user_id).await? {
            Some(profile) => profile,
            None if create => CompanionProfile::new(user_id, 0),
            None => return Err(WalletError::NotFound("companion")),
        };
        f(&mut profile)?;
        profile.updated_at = chrono::Utc::now();
        tx.save_companion(&profile).await?;
        Ok(profile)
    }
}
