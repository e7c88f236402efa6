/// Cron schedule parsing for cron-triggered workflows
///
/// Accepts 5-field cron, 6-field cron (with seconds) and a few plain phrases
/// ("every 5 minutes", "hourly", "every day at 09:30"). All schedules are evaluated in UTC.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid schedule: {0}")]
pub struct ScheduleError(pub String);

/// Normalize a schedule string to a 6-field cron expression
///
/// - "every N seconds|minutes|hours"
/// - "every minute" / "minutely", "every hour" / "hourly", "every day" / "daily"
/// - "every day at HH:MM"
pub fn normalize_schedule(input: &str) -> Result<String, ScheduleError> {
    let trimmed = input.trim();
    let invalid = || ScheduleError(input.to_string());

    let fields = trimmed.split_whitespace().count();
    if fields == 5 {
        return Ok(format!("0 {}", trimmed));
    }
    if fields == 6 {
        return Ok(trimmed.to_string());
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".into()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".into()),
        "every day" | "daily" => return Ok("0 0 0 * * *".into()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(invalid)?;

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {} {} * * *", minute, hour));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(ScheduleError("interval must be greater than zero".into()));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{} * * * * *", n)),
        "minute" => Ok(format!("0 */{} * * * *", n)),
        "hour" => Ok(format!("0 0 */{} * * *", n)),
        _ => Err(invalid()),
    }
}

/// A parsed, validated schedule
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: croner::Cron,
}

impl CronSchedule {
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let expression = normalize_schedule(input)?;
        let cron = expression
            .parse::<croner::Cron>()
            .map_err(|e| ScheduleError(format!("{}: {}", input, e)))?;
        Ok(Self { expression, cron })
    }

    /// Normalized 6-field expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `from`
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.iter_after(from).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_gets_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn phrases_normalize_to_cron() {
        assert_eq!(normalize_schedule("every 5 minutes").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("Every 2 Hours").unwrap(), "0 0 */2 * * *");
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("every day at 09:30").unwrap(), "0 30 9 * * *");
        assert_eq!(normalize_schedule("every 1 minute").unwrap(), "0 */1 * * * *");
    }

    #[test]
    fn rejects_nonsense() {
        assert!(normalize_schedule("run whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every day at 25:00").is_err());
        assert!(normalize_schedule("every 3 fortnights").is_err());
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let schedule = CronSchedule::parse("every 5 minutes").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();
        assert_eq!(
            schedule.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 10, 0).unwrap())
        );

        let between = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 12).unwrap();
        assert_eq!(
            schedule.next_after(between),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 10, 0).unwrap())
        );
    }
}
