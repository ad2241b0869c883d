// Lunar os Library
// Provides: time, clock, date, difftime, getenv

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use rustc_hash::FxHashMap;

use super::{arg, check_number, check_string, check_table, library_table, opt_string, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::vm::{Table, Value, ValueCaller};

pub fn create_os_lib() -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("time", os_time);
    functions.insert("clock", os_clock);
    functions.insert("date", os_date);
    functions.insert("difftime", os_difftime);
    functions.insert("getenv", os_getenv);

    library_table(functions)
}

fn os_time(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    if arg(&args, 0).is_nil() {
        return Ok(Value::integer(Utc::now().timestamp()));
    }
    let table = check_table(&args, 0, "time")?;
    let table = table.borrow();
    let naive = date_from_fields(&table)?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| LuaError::runtime("time result cannot be represented in this installation"))?;
    Ok(Value::integer(local.timestamp()))
}

fn date_field(table: &Table, key: &str, default: Option<i64>) -> LuaResult<i64> {
    match table.get_str(key) {
        Value::Nil => default.ok_or_else(|| LuaError::runtime(format!("field '{}' missing in date table", key))),
        value => value
            .to_integer()
            .ok_or_else(|| LuaError::runtime(format!("field '{}' is not an integer", key))),
    }
}

/// Builds a date from `os.time` fields, carrying out-of-range values over
fn date_from_fields(table: &Table) -> LuaResult<NaiveDateTime> {
    let year = date_field(table, "year", None)?;
    let month = date_field(table, "month", None)?;
    let day = date_field(table, "day", None)?;
    let hour = date_field(table, "hour", Some(12))?;
    let min = date_field(table, "min", Some(0))?;
    let sec = date_field(table, "sec", Some(0))?;

    let out_of_range = || LuaError::runtime("field 'year' is out-of-bound");
    let months = year
        .checked_mul(12)
        .and_then(|m| m.checked_add(month.saturating_sub(1)))
        .ok_or_else(out_of_range)?;
    let year = i32::try_from(months.div_euclid(12)).map_err(|_| out_of_range())?;
    let month = months.rem_euclid(12) as u32 + 1;

    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(out_of_range)?;
    [
        TimeDelta::try_days(day.saturating_sub(1)),
        TimeDelta::try_hours(hour),
        TimeDelta::try_minutes(min),
        TimeDelta::try_seconds(sec),
    ]
    .into_iter()
    .try_fold(start, |at, delta| delta.and_then(|d| at.checked_add_signed(d)))
    .ok_or_else(out_of_range)
}

fn os_clock(caller: &mut dyn ValueCaller, _args: Vec<Value>) -> LuaResult<Value> {
    Ok(Value::float(caller.runtime().elapsed()))
}

fn os_date(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let format = opt_string(&args, 0, "date")?;
    let timestamp = match arg(&args, 1) {
        Value::Nil => Utc::now().timestamp(),
        _ => check_number(&args, 1, "date")?
            .as_integer()
            .ok_or_else(|| LuaError::bad_argument(2, "date", "number has no integer representation"))?,
    };
    let utc = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| LuaError::bad_argument(2, "date", "time out-of-bounds"))?;

    let text = match &format {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "%c".to_string(),
    };
    let (text, universal) = match text.strip_prefix('!') {
        Some(rest) => (rest.to_string(), true),
        None => (text, false),
    };

    if universal {
        render_date(&text, &utc)
    } else {
        render_date(&text, &utc.with_timezone(&Local))
    }
}

fn render_date<Tz: TimeZone>(format: &str, at: &DateTime<Tz>) -> LuaResult<Value>
where
    Tz::Offset: std::fmt::Display,
{
    if format.starts_with("*t") {
        return Ok(Value::table(date_table(&at.naive_local())));
    }
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(LuaError::bad_argument(1, "date", format!("invalid conversion specifier '{}'", format)));
    }
    Ok(Value::string(&at.format_with_items(items.into_iter()).to_string()))
}

fn date_table(at: &NaiveDateTime) -> Table {
    let mut table = Table::new();
    table.set_str("year", Value::integer(at.year() as i64));
    table.set_str("month", Value::integer(at.month() as i64));
    table.set_str("day", Value::integer(at.day() as i64));
    table.set_str("hour", Value::integer(at.hour() as i64));
    table.set_str("min", Value::integer(at.minute() as i64));
    table.set_str("sec", Value::integer(at.second() as i64));
    table.set_str("wday", Value::integer(at.weekday().number_from_sunday() as i64));
    table.set_str("yday", Value::integer(at.ordinal() as i64));
    table.set_str("isdst", Value::Boolean(false));
    table
}

fn os_difftime(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let t2 = check_number(&args, 0, "difftime")?.as_f64();
    let t1 = match arg(&args, 1) {
        Value::Nil => 0.0,
        _ => check_number(&args, 1, "difftime")?.as_f64(),
    };
    Ok(super::float_result(caller, t2 - t1))
}

fn os_getenv(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let name = check_string(&args, 0, "getenv")?;
    let name = String::from_utf8_lossy(&name);
    Ok(match std::env::var_os(name.as_ref()) {
        Some(value) => Value::string(&value.to_string_lossy()),
        None => Value::Nil,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(year: i64, month: i64, day: i64) -> Table {
        let mut table = Table::new();
        table.set_str("year", Value::integer(year));
        table.set_str("month", Value::integer(month));
        table.set_str("day", Value::integer(day));
        table
    }

    #[test]
    fn out_of_range_fields_carry_over() {
        let at = date_from_fields(&fields(2023, 13, 32)).unwrap();
        assert_eq!((at.year(), at.month(), at.day(), at.hour()), (2024, 2, 1, 12));

        let at = date_from_fields(&fields(2024, 3, 0)).unwrap();
        assert_eq!((at.month(), at.day()), (2, 29));
    }

    #[test]
    fn missing_date_fields_are_errors() {
        let mut table = fields(2024, 1, 1);
        table.set_str("day", Value::Nil);
        let err = date_from_fields(&table).unwrap_err();
        assert!(err.message.contains("field 'day' missing"));
    }

    #[test]
    fn date_table_uses_sunday_as_day_one() {
        let at = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap().and_hms_opt(8, 30, 0).unwrap();
        let table = date_table(&at);
        assert_eq!(table.get_str("wday"), Value::integer(1));
        assert_eq!(table.get_str("yday"), Value::integer(154));
        assert_eq!(table.get_str("min"), Value::integer(30));
    }
}
