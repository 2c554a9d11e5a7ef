// CSV export of scripted-run data
use crate::domain::cycle::CyclePoint;
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: [&str; 9] = [
    "timestamp",
    "elapsed_s",
    "phase",
    "phase_type",
    "voltage_v",
    "current_a",
    "capacity_mah",
    "energy_mwh",
    "temperature_c",
];

/// `<dir>/test_cycle_YYYYmmdd_HHMMSS.csv`
pub fn default_export_path(dir: &Path, now: DateTime<Local>) -> PathBuf {
    dir.join(format!("test_cycle_{}.csv", now.format("%Y%m%d_%H%M%S")))
}

fn record(point: &CyclePoint) -> [String; 9] {
    [
        point.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        format!("{:.1}", point.elapsed_s),
        point.phase.clone(),
        point.phase_type.to_string(),
        format!("{:.3}", point.voltage_v),
        format!("{:.3}", point.current_a),
        format!("{:.1}", point.capacity_mah),
        format!("{:.1}", point.energy_mwh),
        format!("{:.1}", point.temperature_c),
    ]
}

pub fn write_points<W: Write>(out: W, points: &[CyclePoint]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(CSV_HEADER)?;
    for point in points {
        writer.write_record(record(point))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn export_to_file(path: &Path, points: &[CyclePoint]) -> Result<(), csv::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    write_points(file, points)?;
    tracing::info!("Exported {} data points to '{}'", points.len(), path.display());
    Ok(())
}
