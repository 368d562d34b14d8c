//! Pluggable function handlers
//!
//! Call-style values (`now()`, `today(-1y)`, `currentUser()`) are resolved by
//! an ordered list of handlers. Handlers are tried in registration order and
//! the first one accepting a function name and desired kind wins; registration
//! order therefore IS the dispatch contract, and more specific handlers must
//! be registered before more general ones.

use std::sync::Arc;

use chrono::{Datelike, Duration, Local, Months, NaiveDateTime, Weekday};
use saker_schema::{PropertyKind, ScalarValue, TypeConverter};

use crate::ast::EqlArg;
use crate::error::{EqlError, Result};

/// Resolver for one family of call-style values.
pub trait EqlFunctionHandler: Send + Sync {
    /// Whether this handler resolves `name` into the desired kind.
    fn accepts(&self, name: &str, target: &PropertyKind) -> bool;

    /// Resolve the function call into a typed value.
    ///
    /// Handlers fail loudly on unsupported argument shapes or arity; they
    /// never fall through to another handler once accepted.
    fn apply(
        &self,
        name: &str,
        args: &[EqlArg],
        target: &PropertyKind,
        converter: &dyn TypeConverter,
    ) -> Result<ScalarValue>;
}

/// Ordered handler list, first accepting handler wins.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: Vec<Box<dyn EqlFunctionHandler>>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in date/time functions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DateFunctions));
        registry
    }

    /// Append a handler. Later registrations are consulted after earlier ones.
    pub fn register(&mut self, handler: Box<dyn EqlFunctionHandler>) {
        self.handlers.push(handler);
    }

    /// First handler accepting the function name and desired kind.
    pub fn find(&self, name: &str, target: &PropertyKind) -> Option<&dyn EqlFunctionHandler> {
        self.handlers
            .iter()
            .find(|handler| handler.accepts(name, target))
            .map(|handler| handler.as_ref())
    }
}

// ============================================================================
// Date/time functions
// ============================================================================

/// Built-in date functions: `now`, `today`, the weekday names, and the period
/// starts `day`/`week`/`month`/`year`.
///
/// Each computes a base date-time and then applies the string-literal period
/// modifiers given as arguments (`-1y`, `+2d`, `+1M10d`), accumulating
/// calendar months and wall-clock durations onto the base. The result is
/// converted to the caller's desired representation. Nothing is memoized;
/// every translation re-reads the clock.
pub struct DateFunctions;

const DATE_FUNCTIONS: &[&str] = &[
    "now", "today", "day", "week", "month", "year", "monday", "tuesday", "wednesday", "thursday",
    "friday", "saturday", "sunday",
];

impl EqlFunctionHandler for DateFunctions {
    fn accepts(&self, name: &str, target: &PropertyKind) -> bool {
        let name = name.to_lowercase();
        DATE_FUNCTIONS.contains(&name.as_str())
            && matches!(
                target.element_kind(),
                PropertyKind::Date | PropertyKind::DateTime | PropertyKind::Integer
            )
    }

    fn apply(
        &self,
        name: &str,
        args: &[EqlArg],
        target: &PropertyKind,
        _converter: &dyn TypeConverter,
    ) -> Result<ScalarValue> {
        let mut result = base_time(&name.to_lowercase(), Local::now().naive_local())
            .ok_or_else(|| EqlError::function_application(name, "unknown date function"))?;

        for arg in args {
            let modifier = arg
                .raw_text()
                .or_else(|| arg.as_value().and_then(|v| v.as_str()))
                .ok_or_else(|| {
                    EqlError::function_application(
                        name,
                        "period modifiers must be string literals, e.g. '-1y'",
                    )
                })?;
            let delta = parse_period_modifier(modifier)
                .ok_or_else(|| {
                    EqlError::function_application(
                        name,
                        format!("invalid period modifier '{}'", modifier),
                    )
                })?;
            result = delta.apply(result).ok_or_else(|| {
                EqlError::function_application(
                    name,
                    format!("period modifier '{}' out of range", modifier),
                )
            })?;
        }

        match target.element_kind() {
            PropertyKind::Date => Ok(ScalarValue::Date(result.date())),
            PropertyKind::DateTime => Ok(ScalarValue::DateTime(result)),
            PropertyKind::Integer => Ok(ScalarValue::Int(result.and_utc().timestamp_millis())),
            other => Err(EqlError::function_application(
                name,
                format!("cannot produce a {} value", other),
            )),
        }
    }
}

/// Base time of a date function, relative to `now`.
fn base_time(name: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let midnight = now.date().and_hms_opt(0, 0, 0)?;
    match name {
        "now" => Some(now),
        "today" | "day" => Some(midnight),
        "week" => start_of_week(midnight),
        "month" => midnight.date().with_day(1)?.and_hms_opt(0, 0, 0),
        "year" => midnight.date().with_day(1)?.with_month(1)?.and_hms_opt(0, 0, 0),
        weekday => {
            let target = weekday.parse::<Weekday>().ok()?;
            let monday = start_of_week(midnight)?;
            monday.checked_add_signed(Duration::days(target.num_days_from_monday() as i64))
        }
    }
}

fn start_of_week(midnight: NaiveDateTime) -> Option<NaiveDateTime> {
    let back = midnight.weekday().num_days_from_monday() as i64;
    midnight.checked_sub_signed(Duration::days(back))
}

/// Combined calendar-period and wall-clock-duration delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeriodDelta {
    months: i64,
    duration: Duration,
}

impl PeriodDelta {
    fn apply(&self, base: NaiveDateTime) -> Option<NaiveDateTime> {
        let with_months = if self.months >= 0 {
            base.checked_add_months(Months::new(u32::try_from(self.months).ok()?))?
        } else {
            base.checked_sub_months(Months::new(u32::try_from(-self.months).ok()?))?
        };
        with_months.checked_add_signed(self.duration)
    }
}

/// Parse a modifier like `-1y`, `+2d` or `+1M10d`: an optional sign followed
/// by one or more `<number><unit>` terms. The sign applies to every term.
/// Units: `y` year, `M` month, `w` week, `d` day, `h` hour, `m` minute,
/// `s` second.
fn parse_period_modifier(raw: &str) -> Option<PeriodDelta> {
    let trimmed = raw.trim();
    let (sign, rest) = match trimmed.chars().next()? {
        '+' => (1i64, &trimmed[1..]),
        '-' => (-1i64, &trimmed[1..]),
        _ => (1i64, trimmed),
    };
    if rest.is_empty() {
        return None;
    }

    let mut months = 0i64;
    let mut duration = Duration::zero();
    let mut chars = rest.chars().peekable();

    while chars.peek().is_some() {
        let mut amount = 0i64;
        let mut digits = 0;
        while let Some(c) = chars.peek().copied() {
            if let Some(digit) = c.to_digit(10) {
                amount = amount.checked_mul(10)?.checked_add(digit as i64)?;
                digits += 1;
                chars.next();
            } else {
                break;
            }
        }
        if digits == 0 {
            return None;
        }
        // Bound each term so duration construction cannot overflow.
        if amount > 1_000_000 {
            return None;
        }
        let amount = amount.checked_mul(sign)?;
        match chars.next()? {
            'y' => months = months.checked_add(amount.checked_mul(12)?)?,
            'M' => months = months.checked_add(amount)?,
            'w' => duration = duration.checked_add(&Duration::weeks(amount))?,
            'd' => duration = duration.checked_add(&Duration::days(amount))?,
            'h' => duration = duration.checked_add(&Duration::hours(amount))?,
            'm' => duration = duration.checked_add(&Duration::minutes(amount))?,
            's' => duration = duration.checked_add(&Duration::seconds(amount))?,
            _ => return None,
        }
    }

    Some(PeriodDelta { months, duration })
}

// ============================================================================
// Current user
// ============================================================================

/// Ambient security context consulted by `currentUser()`.
pub trait CurrentUserProvider: Send + Sync {
    /// Name of the authenticated principal, if any.
    fn current_user(&self) -> Option<String>;
}

/// `currentUser()` handler. The provider is read at apply time, so the value
/// is fresh on every query execution.
pub struct CurrentUserFunction {
    provider: Arc<dyn CurrentUserProvider>,
}

impl CurrentUserFunction {
    pub fn new(provider: Arc<dyn CurrentUserProvider>) -> Self {
        Self { provider }
    }
}

impl EqlFunctionHandler for CurrentUserFunction {
    fn accepts(&self, name: &str, target: &PropertyKind) -> bool {
        name.eq_ignore_ascii_case("currentUser")
            && matches!(
                target.element_kind(),
                PropertyKind::Text | PropertyKind::Entity
            )
    }

    fn apply(
        &self,
        name: &str,
        args: &[EqlArg],
        _target: &PropertyKind,
        _converter: &dyn TypeConverter,
    ) -> Result<ScalarValue> {
        if !args.is_empty() {
            return Err(EqlError::function_application(name, "takes no arguments"));
        }
        self.provider
            .current_user()
            .map(ScalarValue::Text)
            .ok_or_else(|| EqlError::function_application(name, "no authenticated principal"))
    }
}
