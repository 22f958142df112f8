pub mod coupon;
pub mod invite;
pub mod order;
pub mod payment;
pub mod plan;
pub mod server;
pub mod stat;
pub mod user;

/// One gibibyte, the unit plans express traffic in.
pub const GB: i64 = 1_073_741_824;
