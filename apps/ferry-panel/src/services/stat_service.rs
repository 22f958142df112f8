use anyhow::Result;
use chrono::{Datelike, Duration, FixedOffset, Months, NaiveDate, Utc};
use ferry_db::models::stat::{DailyIncome, DailyRecord, DailyTypeTotal, ServerTraffic, StatUser};
use ferry_db::repositories::stat_repo::StatRepository;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::info;

use crate::error::rejected;
use crate::utils;

const ORDER_CHART_DAYS: i64 = 31;
const RANK_LIMIT: i64 = 10;
const MIN_PAGE_SIZE: i64 = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Overview {
    pub month_income: i64,
    pub month_register_total: i64,
    pub ticket_pending_total: i64,
    pub commission_pending_total: i64,
    pub day_income: i64,
    pub last_month_income: i64,
    pub commission_month_payout: i64,
    pub commission_last_month_payout: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    #[serde(rename = "type")]
    pub series: &'static str,
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankEntry {
    pub server_id: i64,
    pub server_type: String,
    pub server_name: Option<String>,
    /// GB.
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnlinePresence {
    pub last_10_minutes: i64,
    pub today: i64,
    pub last_3_days: i64,
    pub last_7_days: i64,
    pub last_15_days: i64,
    pub last_30_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowWindow {
    pub period: &'static str,
    pub servers: Vec<ServerTraffic>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct IncomeTotals {
    pub income: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finances {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub current: IncomeTotals,
    pub previous: IncomeTotals,
    pub last_year: IncomeTotals,
    pub mom: f64,
    pub yoy: f64,
    pub chart: Vec<DailyIncome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartGroup {
    Day,
    Week,
    Month,
    Quarter,
    HalfYear,
    Year,
}

impl FromStr for ChartGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "day" => Ok(ChartGroup::Day),
            "week" => Ok(ChartGroup::Week),
            "month" => Ok(ChartGroup::Month),
            "quarter" => Ok(ChartGroup::Quarter),
            "half_year" => Ok(ChartGroup::HalfYear),
            "year" => Ok(ChartGroup::Year),
            other => Err(rejected(format!("Unknown chart grouping {}", other))),
        }
    }
}

impl ChartGroup {
    pub fn label(&self, day: NaiveDate) -> String {
        match self {
            ChartGroup::Day => day.format("%Y-%m-%d").to_string(),
            ChartGroup::Week => {
                let week = day.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            ChartGroup::Month => day.format("%Y-%m").to_string(),
            ChartGroup::Quarter => format!("{}-Q{}", day.year(), (day.month() - 1) / 3 + 1),
            ChartGroup::HalfYear => format!("{}-H{}", day.year(), if day.month() <= 6 { 1 } else { 2 }),
            ChartGroup::Year => day.year().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ColumnPoint {
    pub label: String,
    pub new_count: i64,
    pub new_amount: i64,
    pub renew_count: i64,
    pub renew_amount: i64,
    pub renewal_rate: f64,
}

#[derive(Clone)]
pub struct StatService {
    stats: StatRepository,
    tz: FixedOffset,
}

impl StatService {
    pub fn new(pool: PgPool, tz: FixedOffset) -> Self {
        Self {
            stats: StatRepository::new(pool),
            tz,
        }
    }

    fn day_range(&self, first: NaiveDate, last: NaiveDate) -> Result<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)> {
        let after = last.succ_opt().ok_or_else(|| rejected("Date is out of range"))?;
        Ok((
            utils::local_day_start(&self.tz, first),
            utils::local_day_start(&self.tz, after),
        ))
    }

    pub async fn overview(&self) -> Result<Overview> {
        let today = utils::local_today(&self.tz);
        let month_start = today.with_day(1).unwrap_or(today);
        let last_month_start = month_start - Months::new(1);

        let now = Utc::now();
        let month_from = utils::local_day_start(&self.tz, month_start);
        let last_month_from = utils::local_day_start(&self.tz, last_month_start);
        let today_from = utils::local_day_start(&self.tz, today);

        Ok(Overview {
            month_income: self.stats.income_between(month_from, now).await?.0,
            month_register_total: self.stats.registrations_between(month_from, now).await?,
            ticket_pending_total: self.stats.count_open_tickets(None).await?,
            commission_pending_total: self.stats.count_pending_commission().await?,
            day_income: self.stats.income_between(today_from, now).await?.0,
            last_month_income: self.stats.income_between(last_month_from, month_from).await?.0,
            commission_month_payout: self.stats.commission_paid_between(month_from, now).await?,
            commission_last_month_payout: self
                .stats
                .commission_paid_between(last_month_from, month_from)
                .await?,
        })
    }

    /// Daily payment and commission series for the last month of records.
    pub async fn order_series(&self) -> Result<Vec<SeriesPoint>> {
        let mut rows = self.stats.recent(ORDER_CHART_DAYS).await?;
        rows.reverse();
        let mut points = Vec::with_capacity(rows.len() * 4);
        for row in rows {
            let date = row.record_at.format("%m-%d").to_string();
            points.push(SeriesPoint { series: "Payment amount", date: date.clone(), value: cents(row.paid_total) });
            points.push(SeriesPoint { series: "Payment count", date: date.clone(), value: row.paid_count as f64 });
            points.push(SeriesPoint { series: "Commission amount", date: date.clone(), value: cents(row.commission_total) });
            points.push(SeriesPoint { series: "Commission count", date, value: row.commission_count as f64 });
        }
        Ok(points)
    }

    pub async fn server_last_rank(&self) -> Result<Vec<RankEntry>> {
        let yesterday = utils::local_today(&self.tz) - Duration::days(1);
        let rows = self.stats.server_traffic(yesterday, yesterday, Some(RANK_LIMIT)).await?;
        Ok(rows
            .into_iter()
            .map(|r| RankEntry {
                server_id: r.server_id,
                server_type: r.server_type,
                server_name: r.server_name,
                total: utils::bytes_to_gb(r.total),
            })
            .collect())
    }

    pub async fn stat_user(&self, user_id: i64, page: i64, page_size: i64) -> Result<(Vec<StatUser>, i64)> {
        self.stats
            .user_traffic_page(user_id, page, page_size.max(MIN_PAGE_SIZE))
            .await
    }

    pub async fn online_presence(&self) -> Result<OnlinePresence> {
        let now = Utc::now();
        let today = utils::local_day_start(&self.tz, utils::local_today(&self.tz));
        Ok(OnlinePresence {
            last_10_minutes: self.stats.count_active_users(now - Duration::minutes(10)).await?,
            today: self.stats.count_active_users(today).await?,
            last_3_days: self.stats.count_active_users(now - Duration::days(3)).await?,
            last_7_days: self.stats.count_active_users(now - Duration::days(7)).await?,
            last_15_days: self.stats.count_active_users(now - Duration::days(15)).await?,
            last_30_days: self.stats.count_active_users(now - Duration::days(30)).await?,
        })
    }

    pub async fn nodal_flow(&self) -> Result<Vec<FlowWindow>> {
        const WINDOWS: [(&str, i64); 7] = [
            ("today", 0),
            ("7_days", 7),
            ("15_days", 15),
            ("30_days", 30),
            ("90_days", 90),
            ("180_days", 180),
            ("365_days", 365),
        ];
        let today = utils::local_today(&self.tz);
        let mut flow = Vec::with_capacity(WINDOWS.len());
        for (period, days) in WINDOWS {
            let since = today - Duration::days(days);
            flow.push(FlowWindow {
                period,
                servers: self.stats.server_traffic(since, today, None).await?,
            });
        }
        Ok(flow)
    }

    /// Income over `[start, end]` against the previous equal-length period
    /// and the same period a year earlier. Defaults to this month so far.
    pub async fn finances(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Finances> {
        let today = utils::local_today(&self.tz);
        let end = end.unwrap_or(today);
        let start = start.unwrap_or_else(|| end.with_day(1).unwrap_or(end));
        let windows = FinanceWindows::new(start, end)?;
        let (from, to) = self.day_range(start, end)?;

        let current = self.totals(start, end).await?;
        let previous = self.totals(windows.previous.0, windows.previous.1).await?;
        let last_year = self.totals(windows.last_year.0, windows.last_year.1).await?;

        let chart = self
            .stats
            .daily_income(from, to, self.tz.local_minus_utc())
            .await?;

        Ok(Finances {
            start,
            end,
            current,
            previous,
            last_year,
            mom: growth(current.income, previous.income),
            yoy: growth(current.income, last_year.income),
            chart,
        })
    }

    async fn totals(&self, first: NaiveDate, last: NaiveDate) -> Result<IncomeTotals> {
        let (from, to) = self.day_range(first, last)?;
        let (income, count) = self.stats.income_between(from, to).await?;
        Ok(IncomeTotals { income, count })
    }

    pub async fn column_chart(&self, group: ChartGroup, start: NaiveDate, end: NaiveDate) -> Result<Vec<ColumnPoint>> {
        if start > end {
            return Err(rejected("Start date must not be after the end date"));
        }
        let (from, to) = self.day_range(start, end)?;
        let rows = self
            .stats
            .daily_type_totals(from, to, self.tz.local_minus_utc())
            .await?;
        Ok(group_columns(group, &rows))
    }

    /// Writes the `stats` row of `date`.
    pub async fn record_daily(&self, date: NaiveDate) -> Result<DailyRecord> {
        let (from, to) = self.day_range(date, date)?;
        let record = self.stats.collect_daily(date, from, to).await?;
        self.stats.upsert_daily(date, &record).await?;
        info!(
            "Recorded stats for {}: {} paid orders, {} registrations",
            date, record.paid_count, record.register_count
        );
        Ok(record)
    }
}

/// Comparison periods of a finance report: the equal-length period right
/// before `[start, end]` and the same dates one year earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinanceWindows {
    pub previous: (NaiveDate, NaiveDate),
    pub last_year: (NaiveDate, NaiveDate),
}

impl FinanceWindows {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(rejected("Start date must not be after the end date"));
        }
        let out_of_range = || rejected("Date is out of range");
        let days = (end - start).num_days();

        let previous_end = start.pred_opt().ok_or_else(out_of_range)?;
        let previous_start = previous_end
            .checked_sub_signed(Duration::days(days))
            .ok_or_else(out_of_range)?;
        let year_start = start.checked_sub_months(Months::new(12)).ok_or_else(out_of_range)?;
        let year_end = end.checked_sub_months(Months::new(12)).ok_or_else(out_of_range)?;

        Ok(Self {
            previous: (previous_start, previous_end),
            last_year: (year_start, year_end),
        })
    }
}

fn cents(value: i64) -> f64 {
    value as f64 / 100.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percentage change from `previous` to `current`.
pub fn growth(current: i64, previous: i64) -> f64 {
    if previous == 0 {
        return if current > 0 { 100.0 } else { 0.0 };
    }
    round2((current - previous) as f64 / previous as f64 * 100.0)
}

pub fn group_columns(group: ChartGroup, rows: &[DailyTypeTotal]) -> Vec<ColumnPoint> {
    let mut buckets: BTreeMap<String, ColumnPoint> = BTreeMap::new();
    for row in rows {
        let label = group.label(row.day);
        let point = buckets.entry(label.clone()).or_insert_with(|| ColumnPoint {
            label,
            ..ColumnPoint::default()
        });
        match row.order_type {
            1 => {
                point.new_count += row.count;
                point.new_amount += row.amount;
            }
            2 => {
                point.renew_count += row.count;
                point.renew_amount += row.amount;
            }
            _ => {}
        }
    }
    buckets
        .into_values()
        .map(|mut p| {
            p.renewal_rate = if p.new_count == 0 {
                0.0
            } else {
                round2(p.renew_count as f64 / p.new_count as f64 * 100.0)
            };
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn row(day: NaiveDate, order_type: i16, count: i64, amount: i64) -> DailyTypeTotal {
        DailyTypeTotal {
            day,
            order_type,
            count,
            amount,
        }
    }

    #[test]
    fn growth_handles_zero_baseline() {
        assert_eq!(growth(500, 0), 100.0);
        assert_eq!(growth(0, 0), 0.0);
        assert_eq!(growth(150, 100), 50.0);
        assert_eq!(growth(1, 3), -66.67);
    }

    #[test]
    fn finance_windows_cover_previous_period_and_last_year() {
        let w = FinanceWindows::new(d(2026, 3, 1), d(2026, 3, 31)).unwrap();
        assert_eq!(w.previous, (d(2026, 1, 29), d(2026, 2, 28)));
        assert_eq!(w.last_year, (d(2025, 3, 1), d(2025, 3, 31)));

        let w = FinanceWindows::new(d(2024, 2, 29), d(2024, 2, 29)).unwrap();
        assert_eq!(w.previous, (d(2024, 2, 28), d(2024, 2, 28)));
        assert_eq!(w.last_year, (d(2023, 2, 28), d(2023, 2, 28)));
    }

    #[test]
    fn finance_windows_reject_dates_at_the_calendar_edge() {
        assert!(FinanceWindows::new(d(2026, 3, 2), d(2026, 3, 1)).is_err());
        assert!(FinanceWindows::new(NaiveDate::MIN, NaiveDate::MIN + Duration::days(10)).is_err());
        let late = NaiveDate::MIN + Duration::days(200);
        assert!(FinanceWindows::new(late, late + Duration::days(300)).is_err());
    }

    #[tokio::test]
    async fn finances_near_date_limits_is_rejected_not_panicking() {
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/ferry_test").unwrap();
        let service = StatService::new(pool, FixedOffset::east_opt(0).unwrap());

        let err = service
            .finances(Some(NaiveDate::MIN), Some(NaiveDate::MIN + Duration::days(10)))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::ServiceError>(),
            Some(crate::error::ServiceError::Rejected(_))
        ));

        let err = service
            .column_chart(ChartGroup::Day, NaiveDate::MAX, NaiveDate::MAX)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<crate::error::ServiceError>().is_some());
    }

    #[test]
    fn labels_per_grouping() {
        let day = d(2026, 8, 14);
        assert_eq!(ChartGroup::Day.label(day), "2026-08-14");
        assert_eq!(ChartGroup::Week.label(day), "2026-W33");
        assert_eq!(ChartGroup::Month.label(day), "2026-08");
        assert_eq!(ChartGroup::Quarter.label(day), "2026-Q3");
        assert_eq!(ChartGroup::HalfYear.label(day), "2026-H2");
        assert_eq!(ChartGroup::Year.label(day), "2026");
        assert!("fortnight".parse::<ChartGroup>().is_err());
        assert_eq!("half_year".parse::<ChartGroup>().unwrap(), ChartGroup::HalfYear);
    }

    #[test]
    fn columns_merge_days_and_compute_renewal_rate() {
        let rows = vec![
            row(d(2026, 1, 5), 1, 4, 4000),
            row(d(2026, 1, 5), 2, 1, 1000),
            row(d(2026, 2, 1), 1, 2, 2000),
            row(d(2026, 3, 9), 2, 3, 3000),
        ];
        let columns = group_columns(ChartGroup::Quarter, &rows);
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].new_count, 6);
        assert_eq!(columns[0].renew_amount, 4000);
        assert_eq!(columns[0].renewal_rate, 66.67);

        let columns = group_columns(ChartGroup::Month, &rows);
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[2].label, "2026-03");
        assert_eq!(columns[2].renewal_rate, 0.0);
    }
}
