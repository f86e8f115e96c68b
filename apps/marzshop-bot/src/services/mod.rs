pub mod notification_service;
pub mod payment_service;
pub mod referral_service;
pub mod subscription_service;
pub mod user_service;
