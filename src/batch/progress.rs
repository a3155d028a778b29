//! Progress reporting: percentage formatting, message templates and
//! human-readable intervals.

use std::time::Duration;

/// Format `current / total` as a percentage string.
///
/// Exactly `"100"` is only produced when `current == total` (or the set is
/// empty). Anything short of that gains decimals until it no longer rounds
/// to 100, so 199 of 200 reads `99.5` rather than a premature `100`.
pub fn percentage(total: usize, current: f64) -> String {
    let total = total as f64;
    if total == 0.0 || total == current {
        return "100".to_string();
    }

    // A new digit every 10x past 200: 199/200 would otherwise round up.
    let mut decimals = ((total / 2.0).log10().floor() - 1.0).max(0.0) as usize;
    loop {
        let value = round_to(current / total * 100.0, decimals);
        if value != 100.0 || decimals >= 15 {
            return format!("{:.*}", decimals, value);
        }
        decimals += 1;
    }
}

/// True if a formatted percentage reports completion
pub fn is_complete(percentage: &str) -> bool {
    percentage == "100"
}

fn round_to(value: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

const INTERVAL_UNITS: &[(u64, &str, &str)] = &[
    (31_536_000, "1 year", "years"),
    (2_592_000, "1 month", "months"),
    (604_800, "1 week", "weeks"),
    (86_400, "1 day", "days"),
    (3_600, "1 hour", "hours"),
    (60, "1 min", "min"),
    (1, "1 sec", "sec"),
];

/// Render a duration with the two most significant adjacent units,
/// e.g. `1 hour 5 min`. Zero renders as `0 sec`.
pub fn format_interval(interval: Duration) -> String {
    let mut remaining = interval.as_secs();
    let mut granularity = 2;
    let mut parts: Vec<String> = Vec::new();

    for &(unit, singular, plural) in INTERVAL_UNITS {
        if remaining >= unit {
            let n = remaining / unit;
            parts.push(if n == 1 {
                singular.to_string()
            } else {
                format!("{} {}", n, plural)
            });
            remaining %= unit;
            granularity -= 1;
        } else if !parts.is_empty() {
            // no skipped levels ("1 year 1 sec")
            break;
        }
        if granularity == 0 {
            break;
        }
    }

    if parts.is_empty() {
        "0 sec".to_string()
    } else {
        parts.join(" ")
    }
}

/// Values substituted into a set's message template.
#[derive(Debug, Clone)]
pub struct ProgressValues<'a> {
    pub current: f64,
    pub remaining: usize,
    pub total: usize,
    pub percentage: &'a str,
    pub elapsed: Duration,
}

impl ProgressValues<'_> {
    /// Linear estimate of the time left, `None` before anything is done.
    pub fn estimate(&self) -> Option<Duration> {
        if self.current > 0.0 {
            let left = (self.total as f64 - self.current).max(0.0);
            Some(self.elapsed.mul_f64(left / self.current))
        } else {
            None
        }
    }
}

/// Substitute `@current`, `@remaining`, `@total`, `@percentage`,
/// `@elapsed` and `@estimate` in `template`.
pub fn render_message(template: &str, values: &ProgressValues<'_>) -> String {
    let estimate = values
        .estimate()
        .map(format_interval)
        .unwrap_or_else(|| "-".to_string());

    template
        .replace("@current", &values.current.floor().to_string())
        .replace("@remaining", &values.remaining.to_string())
        .replace("@total", &values.total.to_string())
        .replace("@percentage", values.percentage)
        .replace("@elapsed", &format_interval(values.elapsed))
        .replace("@estimate", &estimate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_basic() {
        // total=10, remaining=4, last item reported 1
        assert_eq!(percentage(10, (10 - 4) as f64 + 1.0), "70");
        assert_eq!(percentage(3, 1.0), "33");
        assert_eq!(percentage(4, 2.0), "50");
    }

    #[test]
    fn test_percentage_complete() {
        assert_eq!(percentage(5, 5.0), "100");
        assert_eq!(percentage(0, 0.0), "100");
        assert!(is_complete(&percentage(0, 1.0)));
    }

    #[test]
    fn test_percentage_never_rounds_up_to_100() {
        assert_eq!(percentage(200, 199.0), "99.5");
        assert_eq!(percentage(1000, 999.0), "99.9");
        let almost = percentage(1000, 999.9);
        assert!(!is_complete(&almost));
        assert_eq!(almost, "99.99");
    }

    #[test]
    fn test_percentage_fractional_item() {
        assert_eq!(percentage(2, 0.5), "25");
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(Duration::ZERO), "0 sec");
        assert_eq!(format_interval(Duration::from_secs(1)), "1 sec");
        assert_eq!(format_interval(Duration::from_secs(59)), "59 sec");
        assert_eq!(format_interval(Duration::from_secs(65)), "1 min 5 sec");
        assert_eq!(format_interval(Duration::from_secs(3_900)), "1 hour 5 min");
        assert_eq!(format_interval(Duration::from_secs(7_200)), "2 hours");
    }

    #[test]
    fn test_format_interval_does_not_skip_levels() {
        // 1 day + 5 sec: the hour level is empty, so stop after days
        assert_eq!(format_interval(Duration::from_secs(86_405)), "1 day");
    }

    #[test]
    fn test_render_message_placeholders() {
        let values = ProgressValues {
            current: 2.0,
            remaining: 2,
            total: 4,
            percentage: "50",
            elapsed: Duration::from_secs(10),
        };
        let message = render_message(
            "Completed @current of @total (@percentage%), @remaining left, @elapsed, @estimate to go",
            &values,
        );
        assert_eq!(
            message,
            "Completed 2 of 4 (50%), 2 left, 10 sec, 10 sec to go"
        );
    }

    #[test]
    fn test_render_message_estimate_before_progress() {
        let values = ProgressValues {
            current: 0.0,
            remaining: 3,
            total: 3,
            percentage: "0",
            elapsed: Duration::ZERO,
        };
        assert_eq!(render_message("@estimate", &values), "-");
    }
}
