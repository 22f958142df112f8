pub mod coupon_repo;
pub mod invite_repo;
pub mod order_repo;
pub mod payment_repo;
pub mod plan_repo;
pub mod server_repo;
pub mod stat_repo;
pub mod user_repo;

/// Row offset of a 1-based page. Out-of-range pages land past the last row.
pub fn page_offset(page: i64, page_size: i64) -> i64 {
    (page.max(1) - 1).saturating_mul(page_size.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offsets() {
        assert_eq!(page_offset(1, 10), 0);
        assert_eq!(page_offset(0, 10), 0);
        assert_eq!(page_offset(3, 15), 30);
        assert_eq!(page_offset(i64::MAX, 50), i64::MAX);
        assert_eq!(page_offset(4, -5), 0);
    }
}
