use super::{now_unix, AdapterError};
use crate::state::{GpuProcessReading, GpuReading, GpuSnapshot};
use std::path::{Path, PathBuf};
use tokio::process::Command;

const DEVICE_QUERY: &str = "--query-gpu=pci.device_id,pci.bus_id,name,memory.total,memory.used,utilization.gpu,temperature.gpu,power.draw,power.limit";
const PROCESS_QUERY: &str = "--query-compute-apps=gpu_bus_id,pid,process_name,used_memory";
const CSV_FORMAT: &str = "--format=csv,noheader,nounits";
const FIELD_SEPARATOR: &str = ", ";

const DEVICE_FIELDS: usize = 9;
const PROCESS_FIELDS: usize = 4;

// `nounits` memory columns are MiB.
const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Runs `nvidia-smi` (or whatever executable is configured in its place).
#[derive(Debug, Clone)]
pub struct GpuAdapter {
    program: PathBuf,
}

impl GpuAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Queries the device table and then the compute-process table. Either
    /// query failing fails the whole fetch.
    pub async fn fetch_gpu(&self) -> Result<GpuSnapshot, AdapterError> {
        let timestamp = now_unix();

        let devices = self.run(&[DEVICE_QUERY, CSV_FORMAT]).await?;
        let gpus = parse_device_table(&devices)?;

        let processes = self.run(&[PROCESS_QUERY, CSV_FORMAT]).await?;
        let processes = parse_process_table(&processes)?;

        Ok(GpuSnapshot {
            gpus,
            processes,
            timestamp,
        })
    }

    async fn run(&self, args: &[&str]) -> Result<String, AdapterError> {
        let output = match Command::new(&self.program).args(args).output().await {
            Ok(output) => output,
            Err(err) => self.run_fallback(args).await.ok_or(AdapterError::Spawn {
                program: self.program.display().to_string(),
                source: err,
            })?,
        };

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(AdapterError::ToolFailed {
                program: self.program.display().to_string(),
                status: output.status,
                output: text.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[cfg(target_os = "windows")]
    async fn run_fallback(&self, args: &[&str]) -> Option<std::process::Output> {
        if self.program != Path::new("nvidia-smi") {
            return None;
        }
        Command::new(r"C:\Windows\System32\nvidia-smi.exe")
            .args(args)
            .output()
            .await
            .ok()
    }

    #[cfg(not(target_os = "windows"))]
    async fn run_fallback(&self, _args: &[&str]) -> Option<std::process::Output> {
        None
    }
}

pub fn parse_device_table(text: &str) -> Result<Vec<GpuReading>, AdapterError> {
    table_rows(text, "device", DEVICE_FIELDS)?
        .into_iter()
        .map(|parts| {
            Ok(GpuReading {
                device_id: parts[0].to_string(),
                bus_id: parts[1].to_string(),
                name: parts[2].to_string(),
                memory_total_bytes: mib_to_bytes(parts[3]),
                memory_used_bytes: mib_to_bytes(parts[4]),
                utilization_percent: parse_u64_lenient(parts[5]),
                temperature_celsius: parse_u64_lenient(parts[6]),
                power_draw_watts: parse_f64_lenient(parts[7]),
                power_limit_watts: parse_f64_lenient(parts[8]),
            })
        })
        .collect()
}

pub fn parse_process_table(text: &str) -> Result<Vec<GpuProcessReading>, AdapterError> {
    Ok(table_rows(text, "process", PROCESS_FIELDS)?
        .into_iter()
        .map(|parts| GpuProcessReading {
            bus_id: parts[0].to_string(),
            pid: parse_u64_lenient(parts[1]),
            name: parts[2].to_string(),
            memory_used_bytes: mib_to_bytes(parts[3]),
        })
        .collect())
}

/// Splits CSV output into trimmed fields. `nvidia-smi` separates columns with
/// `", "`, so a bare comma inside a value (a decimal comma) stays in its
/// field. Blank lines are skipped; any other line with the wrong field count
/// rejects the whole table.
fn table_rows<'a>(
    text: &'a str,
    table: &'static str,
    expected: usize,
) -> Result<Vec<Vec<&'a str>>, AdapterError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split(FIELD_SEPARATOR).map(|v| v.trim()).collect();
            if parts.len() != expected {
                return Err(AdapterError::FieldCount {
                    table,
                    line: line.to_string(),
                    expected,
                    actual: parts.len(),
                });
            }
            Ok(parts)
        })
        .collect()
}

/// Numeric fields never abort a row: anything that cannot be read as a
/// number, such as `[N/A]`, becomes zero.
pub fn parse_u64_lenient(input: &str) -> u64 {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<u64>() {
        return v;
    }
    match parse_f64_loose(trimmed) {
        Some(v) if v.is_finite() && v > 0.0 => v as u64,
        _ => 0,
    }
}

fn mib_to_bytes(input: &str) -> u64 {
    parse_u64_lenient(input).saturating_mul(BYTES_PER_MIB)
}

pub fn parse_f64_lenient(input: &str) -> f64 {
    parse_f64_loose(input)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-' || *c == '+')
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
