use chrono::{DateTime, FixedOffset, Months, NaiveDate, TimeZone, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;

pub fn format_bytes_str(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Cents as a decimal string, e.g. `1234` -> `12.34`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

pub fn bytes_to_gb(bytes: i64) -> f64 {
    (bytes as f64 / 1_073_741_824.0 * 100.0).round() / 100.0
}

pub fn guid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn random_digits(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Order number: local timestamp plus random digits.
pub fn trade_no(tz: &FixedOffset) -> String {
    format!(
        "{}{}",
        Utc::now().with_timezone(tz).format("%Y%m%d%H%M%S"),
        random_digits(6)
    )
}

pub fn gravatar_url(email: &str) -> String {
    let digest = md5::compute(email.trim().to_lowercase());
    format!("https://cdn.v2ex.com/gravatar/{}?s=64&d=identicon", hex::encode(digest.0))
}

/// Today in the configured timezone.
pub fn local_today(tz: &FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(tz).date_naive()
}

/// Start of `date` in the configured timezone, as UTC.
pub fn local_day_start(tz: &FixedOffset, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&naive).single() {
        Some(dt) => dt.with_timezone(&Utc),
        None => naive.and_utc(),
    }
}

/// Adds calendar months, clamping to the last day of the target month.
pub fn add_months(at: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    at.checked_add_months(Months::new(months)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Picks one entry from a comma separated list.
pub fn pick_one(list: &str) -> Option<String> {
    let items: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        return None;
    }
    Some(items[rand::rng().random_range(0..items.len())].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes_and_cents() {
        assert_eq!(format_bytes_str(512), "512 B");
        assert_eq!(format_bytes_str(1_073_741_824), "1.00 GB");
        assert_eq!(format_cents(1234), "12.34");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-250), "-2.50");
    }

    #[test]
    fn trade_no_is_numeric() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let no = trade_no(&tz);
        assert_eq!(no.len(), 20);
        assert!(no.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn day_start_respects_offset() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(local_day_start(&tz, date).to_rfc3339(), "2024-02-29T16:00:00+00:00");
    }

    #[test]
    fn gravatar_hashes_normalized_email() {
        assert_eq!(gravatar_url(" A@B.com "), gravatar_url("a@b.com"));
    }

    #[test]
    fn add_months_clamps_to_month_end() {
        let at = DateTime::parse_from_rfc3339("2024-01-31T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(add_months(at, 1).to_rfc3339(), "2024-02-29T10:00:00+00:00");
        assert_eq!(add_months(at, 12).to_rfc3339(), "2025-01-31T10:00:00+00:00");
    }

    #[test]
    fn pick_one_ignores_blanks() {
        assert_eq!(pick_one("https://a.example, "), Some("https://a.example".into()));
        assert_eq!(pick_one(""), None);
    }
}
