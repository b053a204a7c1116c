use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Calendar flags of one observation date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalendarFlags {
    pub is_weekend: bool,
    pub is_us_holiday: bool,
    pub is_china_holiday: bool,
}

impl CalendarFlags {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            is_weekend: is_weekend(date),
            is_us_holiday: is_us_holiday(date),
            is_china_holiday: is_china_holiday(date),
        }
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_us_holiday(date: NaiveDate) -> bool {
    // an observed New Year's Day can fall on Dec 31 of the previous year
    us_holidays(date.year()).contains(&date) || us_holidays(date.year() + 1).contains(&date)
}

pub fn is_china_holiday(date: NaiveDate) -> bool {
    china_holidays(date.year()).contains(&date)
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_next = if month == 12 {
        ymd(year + 1, 1, 1)?
    } else {
        ymd(year, month + 1, 1)?
    };
    let mut d = first_next - Duration::days(1);
    while d.weekday() != weekday {
        d -= Duration::days(1);
    }
    Some(d)
}

/// Saturday holidays are observed on Friday, Sunday holidays on Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// US federal holidays of `year`, including weekend observance shifts.
pub fn us_holidays(year: i32) -> BTreeSet<NaiveDate> {
    let mut fixed = vec![ymd(year, 1, 1), ymd(year, 7, 4), ymd(year, 11, 11), ymd(year, 12, 25)];
    if year >= 2021 {
        fixed.push(ymd(year, 6, 19));
    }

    let mut out = BTreeSet::new();
    for d in fixed.into_iter().flatten() {
        out.insert(d);
        out.insert(observed(d));
    }

    let floating = [
        (year >= 1986).then(|| nth_weekday(year, 1, Weekday::Mon, 3)).flatten(),
        nth_weekday(year, 2, Weekday::Mon, 3),
        last_weekday(year, 5, Weekday::Mon),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 10, Weekday::Mon, 2),
        nth_weekday(year, 11, Weekday::Thu, 4),
    ];
    out.extend(floating.into_iter().flatten());
    out
}

/// Gregorian dates of the lunar festivals, by year:
/// (Spring Festival, Qingming, Dragon Boat, Mid-Autumn) as (month, day).
const CHINA_LUNAR: &[(i32, [(u32, u32); 4])] = &[
    (2010, [(2, 14), (4, 5), (6, 16), (9, 22)]),
    (2011, [(2, 3), (4, 5), (6, 6), (9, 12)]),
    (2012, [(1, 23), (4, 4), (6, 23), (9, 30)]),
    (2013, [(2, 10), (4, 4), (6, 12), (9, 19)]),
    (2014, [(1, 31), (4, 5), (6, 2), (9, 8)]),
    (2015, [(2, 19), (4, 5), (6, 20), (9, 27)]),
    (2016, [(2, 8), (4, 4), (6, 9), (9, 15)]),
    (2017, [(1, 28), (4, 4), (5, 30), (10, 4)]),
    (2018, [(2, 16), (4, 5), (6, 18), (9, 24)]),
    (2019, [(2, 5), (4, 5), (6, 7), (9, 13)]),
    (2020, [(1, 25), (4, 4), (6, 25), (10, 1)]),
    (2021, [(2, 12), (4, 4), (6, 14), (9, 21)]),
    (2022, [(2, 1), (4, 5), (6, 3), (9, 10)]),
    (2023, [(1, 22), (4, 5), (6, 22), (9, 29)]),
    (2024, [(2, 10), (4, 4), (6, 10), (9, 17)]),
    (2025, [(1, 29), (4, 4), (5, 31), (10, 6)]),
    (2026, [(2, 17), (4, 5), (6, 19), (9, 25)]),
    (2027, [(2, 6), (4, 5), (6, 9), (9, 15)]),
    (2028, [(1, 26), (4, 4), (5, 28), (10, 3)]),
    (2029, [(2, 13), (4, 4), (6, 16), (9, 22)]),
    (2030, [(2, 3), (4, 5), (6, 5), (9, 12)]),
];

/// China statutory public holidays of `year`.
///
/// Lunar festivals are only known for the years in the built-in table; other
/// years get the solar-fixed holidays alone.
pub fn china_holidays(year: i32) -> BTreeSet<NaiveDate> {
    let mut out: BTreeSet<NaiveDate> = [
        ymd(year, 1, 1),
        ymd(year, 5, 1),
        ymd(year, 10, 1),
        ymd(year, 10, 2),
        ymd(year, 10, 3),
    ]
    .into_iter()
    .flatten()
    .collect();
    if year >= 2025 {
        out.extend(ymd(year, 5, 2));
    }

    let Some((_, [spring, qingming, dragon_boat, mid_autumn])) =
        CHINA_LUNAR.iter().find(|(y, _)| *y == year)
    else {
        return out;
    };

    if let Some(new_year) = ymd(year, spring.0, spring.1) {
        // 2008-2013 and from 2025: eve plus first days; 2014-2024: first three days
        let (from, to) = match year {
            ..=2013 => (-1, 1),
            2014..=2024 => (0, 2),
            _ => (-1, 2),
        };
        out.extend((from..=to).map(|offset| new_year + Duration::days(offset)));
    }
    for (m, d) in [qingming, dragon_boat, mid_autumn] {
        out.extend(ymd(year, *m, *d));
    }
    out
}
