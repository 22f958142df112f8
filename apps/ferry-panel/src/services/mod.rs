pub mod auth_service;
pub mod cache_service;
pub mod commission_service;
pub mod coupon_service;
pub mod mail_service;
pub mod notification_service;
pub mod order_service;
pub mod passport_service;
pub mod payment;
pub mod plan_service;
pub mod server_service;
pub mod stat_service;
pub mod subscription;
pub mod traffic_reset_service;
pub mod traffic_service;
pub mod user_service;
