use std::fs;

const KERNEL_HOSTNAME: &str = "/proc/sys/kernel/hostname";
const FALLBACK_HOSTNAME: &str = "localhost";

/// Best-effort host name reported in render responses.
pub fn hostname() -> String {
    fs::read_to_string(KERNEL_HOSTNAME)
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}
