//! Value parsers for portal-formatted text (money amounts, dates).

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Portal timestamps without an explicit offset are Indian Standard Time.
const PORTAL_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d-%b-%Y %I:%M %p",
    "%d-%b-%Y %H:%M",
    "%d-%m-%Y %H:%M",
    "%d-%m-%Y %I:%M %p",
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y %I:%M %p",
    "%d/%m/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%b-%Y", "%d-%m-%Y", "%d/%m/%Y", "%d %b %Y", "%d %B %Y"];

/// Parse a portal date/time. Date-only values resolve to the end of that day,
/// so a tender closing "on" a date stays open through it.
pub fn parse_portal_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    let offset = FixedOffset::east_opt(PORTAL_UTC_OFFSET_SECS)?;
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return local_to_utc(&offset, naive);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return local_to_utc(&offset, date.and_hms_opt(23, 59, 59)?);
        }
    }
    None
}

fn local_to_utc(offset: &FixedOffset, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Parse an amount like `₹ 1,50,000.00`, `Rs. 2.5 Lakh` or `3 Crore` into rupees.
/// Returns `None` for text without a number (e.g. `NIL`, `As per document`).
/// A unit word only scales the number it directly follows, so an amount
/// repeated in words (`2,50,000 (Two Lakh Fifty Thousand Only)`) is ignored.
pub fn parse_money(text: &str) -> Option<f64> {
    let lower = text.to_lowercase();
    let without_grouping: String = lower.chars().filter(|c| *c != ',').collect();
    let (value, rest) = first_number(&without_grouping)?;
    Some(value * unit_multiplier(rest))
}

fn unit_multiplier(rest: &str) -> f64 {
    let unit: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    match unit.as_str() {
        "crore" | "crores" | "cr" => 10_000_000.0,
        "lakh" | "lakhs" | "lac" | "lacs" => 100_000.0,
        _ => 1.0,
    }
}

/// First decimal number in `text` and the text following it.
fn first_number(text: &str) -> Option<(f64, &str)> {
    let mut start = None;
    let mut end = text.len();
    let mut seen_dot = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_ascii_digit() {
            if start.is_none() {
                start = Some(idx);
            }
            continue;
        }
        if ch == '.' && !seen_dot && start.is_some() {
            seen_dot = true;
            continue;
        }
        if start.is_some() {
            end = idx;
            break;
        }
    }
    let digits = &text[start?..end];
    let value = digits.trim_end_matches('.').parse::<f64>().ok()?;
    Some((value, &text[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_handles_indian_grouping_and_units() {
        assert_eq!(parse_money("₹ 1,50,000.00"), Some(150_000.0));
        assert_eq!(parse_money("Rs. 2.5 Lakh"), Some(250_000.0));
        assert_eq!(parse_money("3 Crore"), Some(30_000_000.0));
        assert_eq!(parse_money("INR 12.5 Cr."), Some(125_000_000.0));
        assert_eq!(parse_money("45000"), Some(45_000.0));
        assert_eq!(parse_money("NIL"), None);
        assert_eq!(parse_money("As per tender document"), None);
    }

    #[test]
    fn amount_in_words_does_not_scale_the_figure() {
        assert_eq!(
            parse_money("Rs. 2,50,000 (Two Lakh Fifty Thousand Only)"),
            Some(250_000.0)
        );
        assert_eq!(parse_money("Rs.1.25Crore"), Some(12_500_000.0));
        assert_eq!(parse_money("48 Lakhs only"), Some(4_800_000.0));
    }

    #[test]
    fn datetimes_without_offset_are_portal_local() {
        let ts = parse_portal_datetime("15-Mar-2026 03:00 PM").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-15T09:30:00+00:00");

        let ts = parse_portal_datetime("2026-03-15 15:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-15T09:30:00+00:00");

        let ts = parse_portal_datetime("15/03/2026 15:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-15T09:30:00+00:00");
    }

    #[test]
    fn rfc3339_keeps_its_offset() {
        let ts = parse_portal_datetime("2026-03-15T10:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-15T10:00:00+00:00");
    }

    #[test]
    fn date_only_resolves_to_end_of_local_day() {
        let ts = parse_portal_datetime("2026-03-15").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-15T18:29:59+00:00");
    }

    #[test]
    fn garbage_dates_are_none() {
        assert_eq!(parse_portal_datetime(""), None);
        assert_eq!(parse_portal_datetime("to be announced"), None);
    }
}
