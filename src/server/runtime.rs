/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Detection order:
/// 1. `RELAY_CPU_LIMIT` env var (explicit override, "4" or "4000m" format)
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. Fallback: `std::thread::available_parallelism()` (host CPU count)
///
/// Without this, tokio defaults to the host CPU count, which over-provisions
/// threads when a container is limited to e.g. 4 cores on a 64-core host.
pub fn worker_thread_count() -> usize {
    if let Ok(value) = std::env::var("RELAY_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from RELAY_CPU_LIMIT: {} threads", threads);
            return threads;
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&max) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from cgroup v2: {} threads", threads);
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using system CPU count: {} threads", threads);
    threads
}

/// Parse a CPU value — supports "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(stripped) = value.strip_suffix('m') {
        stripped.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// Parse cgroup v2 `cpu.max` — format: "quota period" or "max period".
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() >= 2 {
        if parts[0] == "max" {
            return None; // unlimited
        }
        let quota: i64 = parts[0].parse().ok()?;
        let period: i64 = parts[1].parse().ok()?;
        if quota > 0 && period > 0 {
            return Some((quota / period) as usize);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("  8  "), Some(8));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0)); // 0.5 cores → 0, caller clamps to 1
        assert_eq!(parse_cpu_value("not-a-number"), None);
    }

    #[test]
    fn test_parse_cgroup_cpu_max() {
        assert_eq!(parse_cgroup_cpu_max("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_cpu_max("max 100000"), None);
        assert_eq!(parse_cgroup_cpu_max(""), None);
    }
}
