//! Market calendar and session timing.
//!
//! Session boundaries are 09:30/16:00 exchange-local; weekends roll to the
//! nearest trading day. Holiday calendars are not modeled — the broker
//! rejects orders on exchange holidays and the recovery path handles that
//! like any other rejection.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::time::Duration;
use tracing::info;

/// Which trading day's open to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayChoice {
    Today,
    Next,
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn at_local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Tz> {
    // 05:00/09:30/16:00 never fall inside a DST transition gap in exchange
    // timezones, so earliest() always resolves.
    tz.from_local_datetime(&date.and_hms_opt(hour, minute, 0).unwrap())
        .earliest()
        .unwrap()
}

/// Market open for `Today` or the `Next` trading day, 09:30 exchange-local.
///
/// `Next` always starts from the calendar day after `now`; both variants
/// roll forward over Saturday/Sunday.
pub fn trading_day_open(tz: Tz, choice: DayChoice) -> DateTime<Tz> {
    trading_day_open_from(Utc::now().with_timezone(&tz), choice)
}

pub fn trading_day_open_from(now: DateTime<Tz>, choice: DayChoice) -> DateTime<Tz> {
    let mut target = match choice {
        DayChoice::Today => now.date_naive(),
        DayChoice::Next => now.date_naive() + ChronoDuration::days(1),
    };
    while is_weekend(target) {
        target += ChronoDuration::days(1);
    }
    at_local(now.timezone(), target, 9, 30)
}

/// Market close for the session that opens at `open`: same date, 16:00.
pub fn market_close_for(open: DateTime<Tz>) -> DateTime<Tz> {
    at_local(open.timezone(), open.date_naive(), 16, 0)
}

/// Rolls `date` backward to the nearest trading day at or before it.
pub fn previous_trading_day(mut date: NaiveDate) -> NaiveDate {
    while is_weekend(date) {
        date -= ChronoDuration::days(1);
    }
    date
}

/// Pre-market wake time for the following cycle: next calendar day, 05:00
/// exchange-local.
pub fn next_wake_time(now: DateTime<Tz>) -> DateTime<Tz> {
    at_local(
        now.timezone(),
        now.date_naive() + ChronoDuration::days(1),
        5,
        0,
    )
}

/// Waits cooperatively until `open_time`, polling once per second with a
/// throttled countdown log. Pure awaits only, so the broker dispatch task
/// keeps running underneath.
pub async fn await_open(open_time: DateTime<Tz>) {
    let tz = open_time.timezone();
    let mut last_logged: Option<DateTime<Tz>> = None;
    loop {
        let now = Utc::now().with_timezone(&tz);
        let remaining = (open_time - now).num_seconds();
        if remaining <= 0 {
            break;
        }
        let should_log = match last_logged {
            None => true,
            Some(t) => (now - t).num_seconds() >= 30,
        };
        if should_log {
            let (hours, rest) = (remaining / 3600, remaining % 3600);
            let (mins, secs) = (rest / 60, rest % 60);
            info!(
                remaining = format!("{hours:02}:{mins:02}:{secs:02}"),
                "Waiting for market open"
            );
            last_logged = Some(now);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    info!("Market is open");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::US::Eastern;

    fn eastern(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        at_local(Eastern, NaiveDate::from_ymd_opt(y, m, d).unwrap(), h, min)
    }

    #[test]
    fn today_open_is_same_weekday_at_0930() {
        // Wednesday 2025-06-11, pre-open
        let now = eastern(2025, 6, 11, 7, 0);
        let open = trading_day_open_from(now, DayChoice::Today);
        assert_eq!(open, eastern(2025, 6, 11, 9, 30));
    }

    #[test]
    fn next_open_skips_to_following_day() {
        let now = eastern(2025, 6, 11, 7, 0);
        let open = trading_day_open_from(now, DayChoice::Next);
        assert_eq!(open, eastern(2025, 6, 12, 9, 30));
    }

    #[test]
    fn next_open_from_friday_lands_on_monday() {
        // Friday 2025-06-13
        let now = eastern(2025, 6, 13, 10, 0);
        let open = trading_day_open_from(now, DayChoice::Next);
        assert_eq!(open, eastern(2025, 6, 16, 9, 30));
        assert_eq!(open.weekday(), Weekday::Mon);
    }

    #[test]
    fn today_open_from_saturday_rolls_to_monday() {
        let now = eastern(2025, 6, 14, 12, 0);
        let open = trading_day_open_from(now, DayChoice::Today);
        assert_eq!(open, eastern(2025, 6, 16, 9, 30));
    }

    #[test]
    fn next_open_is_a_weekday_strictly_after_now() {
        for day in 9..=15 {
            let now = eastern(2025, 6, day, 11, 0);
            let open = trading_day_open_from(now, DayChoice::Next);
            assert!(open > now);
            assert!(!is_weekend(open.date_naive()));
            assert_eq!((open.hour(), open.minute()), (9, 30));
        }
    }

    #[test]
    fn close_is_1600_same_date() {
        let open = eastern(2025, 6, 11, 9, 30);
        assert_eq!(market_close_for(open), eastern(2025, 6, 11, 16, 0));
    }

    #[test]
    fn expiry_rolls_backward_over_weekends() {
        // Sunday 2025-06-15 -> Friday 2025-06-13
        let sunday = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert_eq!(
            previous_trading_day(sunday),
            NaiveDate::from_ymd_opt(2025, 6, 13).unwrap()
        );
        // Weekdays are untouched
        let wednesday = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        assert_eq!(previous_trading_day(wednesday), wednesday);
    }

    #[test]
    fn wake_time_is_next_day_0500() {
        let now = eastern(2025, 6, 11, 16, 5);
        assert_eq!(next_wake_time(now), eastern(2025, 6, 12, 5, 0));
    }

    #[tokio::test]
    async fn await_open_returns_immediately_when_past_open() {
        let open = Utc::now().with_timezone(&Eastern) - ChronoDuration::seconds(5);
        // Must not hang
        tokio::time::timeout(Duration::from_secs(1), await_open(open))
            .await
            .unwrap();
    }
}
