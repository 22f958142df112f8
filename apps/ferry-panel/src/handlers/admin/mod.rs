// Admin API
// Everything here is mounted under /api/v1/{secure_path} behind admin_auth.

use axum::{Router, middleware};

use crate::AppState;
use crate::auth::admin_auth;

pub mod coupon;
pub mod order;
pub mod payment;
pub mod plan;
pub mod server;
pub mod stat;
pub mod user;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .nest("/plan", plan::routes())
        .nest("/server", server::routes())
        .nest("/payment", payment::routes())
        .nest("/coupon", coupon::routes())
        .nest("/order", order::routes())
        .nest("/user", user::routes())
        .nest("/stat", stat::routes())
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Arc;

    use sqlx::PgPool;

    use crate::services::{
        coupon_service::CouponService, payment::PaymentService, plan_service::PlanService,
        server_service::ServerService,
    };

    fn delete_future<F: Future<Output = anyhow::Result<()>> + Send>(_: &F) {}

    #[tokio::test]
    async fn delete_routes_reach_service_methods_through_arc() {
        let pool = PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let plans = Arc::new(PlanService::new(pool.clone()));
        let servers = Arc::new(ServerService::new(pool.clone()));
        let payments = Arc::new(PaymentService::new(pool.clone(), "https://panel.example".into()));
        let coupons = Arc::new(CouponService::new(pool));

        delete_future(&plans.delete(1));
        delete_future(&servers.delete(1));
        delete_future(&payments.delete(1));
        delete_future(&coupons.delete(1));
    }
}
