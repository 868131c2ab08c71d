// Host-side readings: CPU package temperature.

use std::path::Path;

use sysinfo::Components;
use tracing::instrument;

pub const THERMAL_ROOT: &str = "/sys/class/thermal";

/// Lowest-numbered `thermal_zone<N>/temp` under `root` (millidegrees).
pub fn read_thermal_zone(root: &Path) -> Option<f64> {
    let (_, first) = std::fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|e| {
            let index = e
                .file_name()
                .to_str()?
                .strip_prefix("thermal_zone")?
                .parse::<u32>()
                .ok()?;
            Some((index, e.path().join("temp")))
        })
        .filter(|(_, p)| p.is_file())
        .min_by_key(|(index, _)| *index)?;
    let raw = std::fs::read_to_string(first).ok()?;
    let millis = raw.trim().parse::<i64>().ok()?;
    Some(millis as f64 / 1000.0)
}

/// Fallback through sysinfo's hwmon view; prefers the CPU package sensor.
fn read_components() -> Option<f64> {
    let components = Components::new_with_refreshed_list();
    let readings: Vec<(&str, f32)> = components
        .list()
        .iter()
        .filter_map(|c| Some((c.label(), c.temperature()?)))
        .filter(|(_, t)| t.is_finite())
        .collect();
    readings
        .iter()
        .find(|(label, _)| label.contains("Package id 0"))
        .or_else(|| readings.first())
        .map(|&(_, t)| f64::from(t))
}

/// Host CPU temperature in °C, `None` when no sensor is readable.
#[instrument(fields(repo = "host", operation = "host_cpu_temp"))]
pub async fn host_cpu_temp() -> Option<f64> {
    let result = tokio::task::spawn_blocking(|| {
        read_thermal_zone(Path::new(THERMAL_ROOT)).or_else(read_components)
    })
    .await;
    match result {
        Ok(temp) => temp,
        Err(e) => {
            tracing::warn!(error = %e, operation = "host_cpu_temp", "temperature read panicked");
            None
        }
    }
}
