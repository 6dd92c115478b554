// Linux-specific helpers: physical NIC resolution via /sys/class/net.

/// First interface under /sys/class/net whose device path sits on a PCI bus.
/// Virtual devices (lo, wg*, veth*, bridges) resolve under /sys/devices/virtual and are skipped.
pub(super) fn resolve_physical_interface() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                std::fs::canonicalize(entry.path())
                    .map(|p| p.to_string_lossy().contains("/pci"))
                    .unwrap_or(false)
            })
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.into_iter().next()
    }
    #[cfg(not(target_os = "linux"))]
    None
}
