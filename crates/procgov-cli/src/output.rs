//! Formatted output helpers and value parsers for CLI commands.
//!
//! Provides human-readable byte and event formatting, and the parsers
//! behind size, duration and processor-mask arguments.

use chrono::Local;
use procgov_common::types::JobSettings;
use procgov_ipc::protocol::Notification;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Parses a size such as `512`, `64K`, `100M` or `2G` into bytes.
///
/// # Errors
///
/// Returns a message if the value is not a number with an optional
/// `K`, `M` or `G` suffix, or overflows.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&value[..i], c.to_ascii_uppercase()),
        _ => (value, 'B'),
    };
    let multiplier = match unit {
        'B' => 1,
        'K' => KIB,
        'M' => MIB,
        'G' => GIB,
        other => return Err(format!("unknown size suffix '{other}' (use K, M or G)")),
    };
    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{value}'"))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{value}' is too large"))
}

/// Parses a duration such as `500`, `500ms`, `10s`, `5m` or `2h` into
/// milliseconds. A bare number is milliseconds.
///
/// # Errors
///
/// Returns a message if the value cannot be parsed or overflows.
pub fn parse_duration_ms(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    let multiplier = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => return Err(format!("unknown duration unit '{other}' (use ms, s, m or h)")),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("duration '{value}' is too large"))
}

/// Parses a processor mask, in hexadecimal (`0xF0`) or decimal.
///
/// # Errors
///
/// Returns a message if the value is not a valid non-zero mask.
pub fn parse_mask(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let mask = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|_| format!("invalid processor mask '{value}'"))?;
    if mask == 0 {
        return Err("processor mask must select at least one processor".into());
    }
    Ok(mask)
}

/// Formats a notification as one timestamped line.
#[must_use]
pub fn format_event(event: &Notification) -> String {
    let time = Local::now().format("%H:%M:%S");
    let text = match event {
        Notification::NewProcess { pid, .. } => format!("process {pid} joined the job"),
        Notification::ExitProcess {
            pid,
            abnormal: false,
            ..
        } => format!("process {pid} exited"),
        Notification::ExitProcess {
            pid,
            abnormal: true,
            ..
        } => format!("process {pid} exited abnormally"),
        Notification::JobLimitExceeded { kind, .. } => format!("job exceeded its {kind} limit"),
        Notification::ProcessLimitExceeded { pid, kind, .. } => {
            format!("process {pid} exceeded its {kind} limit")
        }
        Notification::NoActiveProcesses { .. } => "no active processes left".to_owned(),
    };
    format!("[{time}] {}: {text}", event.job_name())
}

/// Formats the limits that are set, one `name: value` line each.
#[must_use]
pub fn format_settings(settings: &JobSettings) -> Vec<String> {
    let mut lines = Vec::new();
    let mut bytes = |label: &str, value: u64| {
        if value > 0 {
            lines.push(format!("{label}: {}", format_bytes(value)));
        }
    };
    bytes("max process memory", settings.max_process_memory);
    bytes("max job memory", settings.max_job_memory);
    bytes("min working set", settings.min_working_set_size);
    bytes("max working set", settings.max_working_set_size);
    bytes("max bandwidth (per second)", settings.max_bandwidth);

    if !settings.cpu_affinity.is_empty() {
        let groups: Vec<String> = settings
            .sorted_affinity()
            .iter()
            .map(|g| format!("{}:{:#x}", g.group, g.mask))
            .collect();
        lines.push(format!("cpu affinity: {}", groups.join(", ")));
    }
    if settings.cpu_max_rate > 0 {
        lines.push(format!(
            "cpu rate: {}.{:02}%",
            settings.cpu_max_rate / 100,
            settings.cpu_max_rate % 100
        ));
    }
    let mut millis = |label: &str, value: u64| {
        if value > 0 {
            lines.push(format!("{label}: {value} ms"));
        }
    };
    millis("process user time", settings.process_user_time_limit_ms);
    millis("job user time", settings.job_user_time_limit_ms);
    millis("clock time", settings.clock_time_limit_ms);

    if settings.active_process_limit > 0 {
        lines.push(format!(
            "max active processes: {}",
            settings.active_process_limit
        ));
    }
    if settings.priority_class != procgov_common::types::PriorityClass::Unset {
        lines.push(format!("priority: {}", settings.priority_class));
    }
    if settings.propagate_on_child_processes {
        lines.push("children stay in the job".to_owned());
    }
    lines
}
