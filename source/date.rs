// https://www.rfc-editor.org/rfc/rfc5322#section-3.3 - Date and Time Specification
// https://www.rfc-editor.org/rfc/rfc3501#section-9 - date-time (INTERNALDATE)
//
// Two parsing tiers: a strict scanner for well-formed dates (the overwhelming majority) and a lax
// regex fallback for the long tail of broken mailers.

use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Zone {
  pub hours: u32,
  pub minutes: u32,
  pub west: bool,
}

impl Zone {
  pub fn from_offset(minutes: i32) -> Self {
    let west = minutes < 0;
    let minutes = minutes.unsigned_abs();
    Self {
      hours: minutes / 60,
      minutes: minutes % 60,
      west,
    }
  }

  pub fn offset_seconds(&self) -> i64 {
    let seconds = i64::from(self.hours) * 3600 + i64::from(self.minutes) * 60;
    if self.west {
      -seconds
    } else {
      seconds
    }
  }
}

// Broken-down time, no zone. `month` is 0-based like the struct tm it descends from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Tm {
  pub year: i64,
  pub month: i64,
  pub day: i64,
  pub hour: i64,
  pub minute: i64,
  pub second: i64,
}

const MONTHS: [&str; 12] = [
  "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

// https://www.rfc-editor.org/rfc/rfc5322#section-4.3
// Obsolete zone names, plus the usual suspects seen in the wild. IST is Israel Standard Time
// here, matching long-standing mail client behaviour.
const ZONES: [(&str, i32); 38] = [
  ("UT", 0),
  ("GMT", 0),
  ("UTC", 0),
  ("AST", -4 * 60),
  ("ADT", -3 * 60),
  ("EST", -5 * 60),
  ("EDT", -4 * 60),
  ("CST", -6 * 60),
  ("CDT", -5 * 60),
  ("MST", -7 * 60),
  ("MDT", -6 * 60),
  ("PST", -8 * 60),
  ("PDT", -7 * 60),
  ("AKST", -9 * 60),
  ("AKDT", -8 * 60),
  ("HST", -10 * 60),
  ("SST", -11 * 60),
  ("WET", 0),
  ("WEST", 60),
  ("BST", 60),
  ("CET", 60),
  ("CEST", 2 * 60),
  ("EET", 2 * 60),
  ("EEST", 3 * 60),
  ("IST", 2 * 60),
  ("IDT", 3 * 60),
  ("MSK", 3 * 60),
  ("MSD", 4 * 60),
  ("GST", 4 * 60),
  ("PKT", 5 * 60),
  ("ICT", 7 * 60),
  ("AWST", 8 * 60),
  ("HKT", 8 * 60),
  ("JST", 9 * 60),
  ("KST", 9 * 60),
  ("AEST", 10 * 60),
  ("NZST", 12 * 60),
  ("NZDT", 13 * 60),
];

fn is_leap(year: i64) -> bool {
  year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_month(month: i64, year: i64) -> i64 {
  const DAYS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
  if month == 1 && is_leap(year) {
    29
  } else {
    DAYS[month as usize]
  }
}

// Seconds since the epoch for a broken-down UTC time, DST ignored. A plain day accumulator:
// exact for 1970..2099 (2100 is the first skipped Gregorian leap year after 2000).
pub fn make_time(tm: &Tm) -> i64 {
  let mut days: i64 = 0;
  if tm.year >= 1970 {
    for year in 1970..tm.year {
      days += if is_leap(year) { 366 } else { 365 };
    }
  } else {
    for year in tm.year..1970 {
      days -= if is_leap(year) { 366 } else { 365 };
    }
  }
  for month in 0..tm.month {
    days += days_in_month(month, tm.year);
  }
  days += tm.day - 1;
  ((days * 24 + tm.hour) * 60 + tm.minute) * 60 + tm.second
}

// Inverse of make_time.
pub fn gmtime(epoch: i64) -> Tm {
  let mut days = epoch.div_euclid(86_400);
  let mut rest = epoch.rem_euclid(86_400);
  let mut tm = Tm {
    year: 1970,
    ..Tm::default()
  };
  loop {
    let in_year = if is_leap(tm.year) { 366 } else { 365 };
    if days >= in_year {
      days -= in_year;
      tm.year += 1;
    } else if days < 0 {
      tm.year -= 1;
      days += if is_leap(tm.year) { 366 } else { 365 };
    } else {
      break;
    }
  }
  while days >= days_in_month(tm.month, tm.year) {
    days -= days_in_month(tm.month, tm.year);
    tm.month += 1;
  }
  tm.day = days + 1;
  tm.hour = rest / 3600;
  rest %= 3600;
  tm.minute = rest / 60;
  tm.second = rest % 60;
  tm
}

// Canonicalise a broken-down time, carrying overflow and underflow across every field.
pub fn normalize_time(tm: &mut Tm) {
  fn carry(value: &mut i64, unit: i64) -> i64 {
    let div = value.div_euclid(unit);
    *value = value.rem_euclid(unit);
    div
  }
  tm.minute += carry(&mut tm.second, 60);
  tm.hour += carry(&mut tm.minute, 60);
  tm.day += carry(&mut tm.hour, 24);
  tm.year += carry(&mut tm.month, 12);
  // Days carry against a month length that shifts underneath them.
  while tm.day < 1 {
    tm.month -= 1;
    if tm.month < 0 {
      tm.month = 11;
      tm.year -= 1;
    }
    tm.day += days_in_month(tm.month, tm.year);
  }
  while tm.day > days_in_month(tm.month, tm.year) {
    tm.day -= days_in_month(tm.month, tm.year);
    tm.month += 1;
    if tm.month > 11 {
      tm.month = 0;
      tm.year += 1;
    }
  }
}

fn month_index(name: &str) -> Option<i64> {
  MONTHS
    .iter()
    .position(|month| month.eq_ignore_ascii_case(name))
    .map(|index| index as i64)
}

fn parse_zone(token: &str) -> Option<Zone> {
  let bytes = token.as_bytes();
  if (bytes.first() == Some(&b'+') || bytes.first() == Some(&b'-')) && bytes.len() == 5 {
    let hours: u32 = token[1..3].parse().ok()?;
    let minutes: u32 = token[3..5].parse().ok()?;
    return Some(Zone {
      hours,
      minutes,
      west: bytes[0] == b'-',
    });
  }
  for (name, offset) in ZONES {
    if name.eq_ignore_ascii_case(token) {
      return Some(Zone::from_offset(offset));
    }
  }
  None
}

fn finish(tm: &Tm, zone: Zone) -> (i64, Zone) {
  (make_time(tm) - zone.offset_seconds(), zone)
}

// Strict tier: `[Wkd, ]dd Mon yyyy HH:MM[:SS] [zone] [(name)]`.
fn parse_strict(input: &str) -> Option<(i64, Zone)> {
  let mut tokens = input.split_ascii_whitespace().peekable();
  if let Some(first) = tokens.peek() {
    if let Some(weekday) = first.strip_suffix(',') {
      if !WEEKDAYS.iter().any(|name| name.eq_ignore_ascii_case(weekday)) {
        return None;
      }
      tokens.next();
    }
  }
  let day: i64 = tokens.next()?.parse().ok()?;
  let month = month_index(tokens.next()?)?;
  let year: i64 = tokens.next()?.parse().ok()?;
  if year < 1000 {
    return None;
  }
  let mut clock = tokens.next()?.split(':');
  let hour: i64 = clock.next()?.parse().ok()?;
  let minute: i64 = clock.next()?.parse().ok()?;
  let second: i64 = match clock.next() {
    Some(second) => second.parse().ok()?,
    None => 0,
  };
  if clock.next().is_some() || day < 1 || day > days_in_month(month, year) {
    return None;
  }
  let zone = match tokens.next() {
    Some(token) if token.starts_with('(') => {
      parse_zone(token.trim_start_matches('(').trim_end_matches(')'))
        .unwrap_or_default()
    }
    // https://www.rfc-editor.org/rfc/rfc5322#section-4.3
    // Unknown zone names are to be considered equivalent to "-0000".
    Some(token) => parse_zone(token).unwrap_or_default(),
    None => Zone::default(),
  };
  // A trailing parenthesised zone name is decoration once an offset was given.
  Some(finish(
    &Tm {
      year,
      month,
      day,
      hour,
      minute,
      second,
    },
    zone,
  ))
}

static LAX: Lazy<regex::Regex> = Lazy::new(|| {
  regex::Regex::new(
    r"(?x)
    (\d{1,2}) \s* [-\s] \s* ([A-Za-z]{3})[A-Za-z]* \s* [-\s] \s* (\d{2,4})
    (?: \s+ (\d{1,2}) : (\d{1,2}) (?: : (\d{1,2}) )? )?
    (?: \s+ ([+-]\d{4} | [A-Za-z]{1,5}) )?",
  )
  .unwrap() // The pattern is a constant.
});

// Lax tier: fish the fields out of whatever surrounds them.
fn parse_lax(input: &str) -> Option<(i64, Zone)> {
  let captures = LAX.captures(input)?;
  let day: i64 = captures[1].parse().ok()?;
  let month = month_index(&captures[2])?;
  let mut year: i64 = captures[3].parse().ok()?;
  if year < 50 {
    year += 2000;
  } else if year < 1000 {
    year += 1900;
  }
  let number = |index: usize| -> i64 {
    captures
      .get(index)
      .and_then(|m| m.as_str().parse().ok())
      .unwrap_or(0)
  };
  let zone = captures
    .get(7)
    .and_then(|m| parse_zone(m.as_str()))
    .unwrap_or_default();
  if day < 1 || day > days_in_month(month, year) {
    return None;
  }
  Some(finish(
    &Tm {
      year,
      month,
      day,
      hour: number(4),
      minute: number(5),
      second: number(6),
    },
    zone,
  ))
}

// RFC 5322 date to seconds since the epoch plus the zone it was written in.
pub fn parse_date(input: &str) -> Option<(i64, Zone)> {
  parse_strict(input).or_else(|| parse_lax(input))
}

// https://www.rfc-editor.org/rfc/rfc3501#section-9
// date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP time SP zone DQUOTE
pub fn parse_internaldate(input: &str) -> Option<(i64, Zone)> {
  let input = input.trim_matches('"').trim();
  let (date, rest) = input.split_once(' ')?;
  let (time, zone) = rest.split_once(' ')?;
  let mut date = date.split('-');
  let day: i64 = date.next()?.trim().parse().ok()?;
  let month = month_index(date.next()?)?;
  let year: i64 = date.next()?.parse().ok()?;
  let mut clock = time.split(':');
  let hour: i64 = clock.next()?.parse().ok()?;
  let minute: i64 = clock.next()?.parse().ok()?;
  let second: i64 = clock.next()?.parse().ok()?;
  let zone = parse_zone(zone)?;
  Some(finish(
    &Tm {
      year,
      month,
      day,
      hour,
      minute,
      second,
    },
    zone,
  ))
}

// `dd-Mon-yyyy HH:MM:SS +zzzz`, the INTERNALDATE wire form expected by APPEND.
pub fn format_internaldate(epoch: i64, zone: &Zone) -> String {
  let tm = gmtime(epoch + zone.offset_seconds());
  format!(
    "{:02}-{}-{:04} {:02}:{:02}:{:02} {}{:02}{:02}",
    tm.day,
    MONTHS[tm.month as usize],
    tm.year,
    tm.hour,
    tm.minute,
    tm.second,
    if zone.west { '-' } else { '+' },
    zone.hours,
    zone.minutes,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn strict() {
    let (epoch, zone) = parse_date("Mon, 15 Jan 2024 09:07:42 +0100").unwrap();
    assert_eq!(1705306062, epoch);
    assert_eq!(
      Zone {
        hours: 1,
        minutes: 0,
        west: false
      },
      zone
    );

    let (epoch, _) = parse_date("15 Jan 2024 09:07 GMT").unwrap();
    assert_eq!(1705309620, epoch);

    // Missing zone means +0000.
    let (epoch, zone) = parse_date("1 Jan 1970 00:00:00").unwrap();
    assert_eq!(0, epoch);
    assert_eq!(Zone::default(), zone);
  }

  #[test]
  fn zone_names() {
    let (est, _) = parse_date("15 Jan 2024 09:07:42 EST").unwrap();
    let (utc, _) = parse_date("15 Jan 2024 09:07:42 +0000").unwrap();
    assert_eq!(utc + 5 * 3600, est);

    let (jst, zone) = parse_date("15 Jan 2024 09:07:42 JST").unwrap();
    assert_eq!(utc - 9 * 3600, jst);
    assert!(!zone.west);

    // https://www.rfc-editor.org/rfc/rfc5322#section-4.3
    // Unknown names read as -0000.
    let (unknown, _) = parse_date("15 Jan 2024 09:07:42 XYZQ").unwrap();
    assert_eq!(utc, unknown);
  }

  #[test]
  fn lax() {
    // Not strict (no yyyy, odd separators) but salvageable.
    let (epoch, _) = parse_date("garbage 15-Jan-24 09:07:42 +0000 trailing").unwrap();
    assert_eq!(1705309662, epoch);

    let (epoch, _) = parse_date("15 January 99 00:00").unwrap();
    assert_eq!(916_358_400, epoch);

    assert_eq!(None, parse_date("not a date at all"));
    assert_eq!(None, parse_date("32 Jan 2024 00:00:00"));
  }

  #[test]
  fn internaldate() {
    let (epoch, _) = parse_internaldate("\"15-Jan-2024 09:07:42 +0000\"").unwrap();
    assert_eq!(1705309662, epoch);

    let zone = Zone {
      hours: 1,
      minutes: 0,
      west: false,
    };
    let (epoch, _) = parse_internaldate("15-Jan-2024 09:07:42 +0100").unwrap();
    assert_eq!(1705306062, epoch);
    assert_eq!(
      "15-Jan-2024 09:07:42 +0100",
      format_internaldate(epoch, &zone)
    );
  }

  #[test]
  fn accumulator() {
    // Round-trips across leap boundaries.
    for epoch in [0, 951_782_400 /* 2000-02-29 */, 4_102_444_799 /* 2099-12-31 */] {
      assert_eq!(epoch, make_time(&gmtime(epoch)));
    }
  }

  #[test]
  fn normalize() {
    let mut tm = Tm {
      year: 2023,
      month: 11,
      day: 31,
      hour: 23,
      minute: 59,
      second: 61,
      ..Tm::default()
    };
    normalize_time(&mut tm);
    assert_eq!(
      Tm {
        year: 2024,
        month: 0,
        day: 1,
        hour: 0,
        minute: 0,
        second: 1,
      },
      tm
    );

    let mut tm = Tm {
      year: 2024,
      month: 0,
      day: 1,
      hour: -1,
      ..Tm::default()
    };
    normalize_time(&mut tm);
    assert_eq!(
      Tm {
        year: 2023,
        month: 11,
        day: 31,
        hour: 23,
        minute: 0,
        second: 0,
      },
      tm
    );
  }
}
