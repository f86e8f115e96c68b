pub mod payment_repo;
pub mod referral_repo;
pub mod subscription_repo;
pub mod user_repo;
