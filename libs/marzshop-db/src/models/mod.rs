pub mod payment;
pub mod referral;
pub mod subscription;
pub mod user;

pub use payment::{Payment, PaymentStatus};
pub use referral::Referral;
pub use subscription::{NewSubscription, Subscription, SubscriptionStatus};
pub use user::User;
