pub mod companions;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod wallets;
