//! The three first-boot services shipped in the image.

use super::{DeregisterPolicy, Dependency, OneShotService};
use crate::executor::openrc::Runlevel;

/// Device-side parameters baked into the service scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Whole-card block device.
    pub disk_device: String,
    /// Partition number of the root filesystem on `disk_device`.
    pub root_partition: u8,
    pub wifi_interface: String,
    pub console: String,
    /// Address pinged to decide whether the internet is reachable.
    pub probe_host: String,
    pub probe_attempts: u32,
    pub probe_interval_secs: u32,
    /// Bound on waiting for an IPv4 address before printing the banner.
    pub ip_poll_attempts: u32,
    pub ip_poll_interval_secs: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            disk_device: "/dev/mmcblk0".to_string(),
            root_partition: 2,
            wifi_interface: "wlan0".to_string(),
            console: "/dev/tty1".to_string(),
            probe_host: "8.8.8.8".to_string(),
            probe_attempts: 15,
            probe_interval_secs: 1,
            ip_poll_attempts: 10,
            ip_poll_interval_secs: 1,
        }
    }
}

impl ServiceSettings {
    /// Kernel name of the root partition (`/dev/mmcblk0p2`).
    pub fn root_partition_device(&self) -> String {
        format!("{}p{}", self.disk_device, self.root_partition)
    }
}

pub const RESIZE_ROOT: &str = "resize-root";
pub const SHOW_IP: &str = "show-ip";
pub const SETUP_MIRRORS: &str = "setup-mirrors";

/// Grow the root partition and filesystem to fill the card.
///
/// Deregisters after the first run even when resizing failed.
pub fn resize_root(settings: &ServiceSettings) -> OneShotService {
    let mut service = OneShotService {
        name: RESIZE_ROOT.to_string(),
        description: "Expands the root partition and filesystem to fill the SD card on first boot."
            .to_string(),
        depends: vec![
            Dependency::Need("localmount".to_string()),
            Dependency::Before("dbus".to_string()),
        ],
        runlevel: Runlevel::Default,
        policy: DeregisterPolicy::Unconditional,
        start_body: String::new(),
    };
    service.start_body = format!(
        "    ebegin \"Expanding root filesystem to fill SD card\"
    parted -s {disk} resizepart {part} 100% || true
    resize2fs {root_dev}
    rc=$?
    [ $rc -eq 0 ] || ewarn \"Root resize failed; it will not be retried\"
    {deregister}
    eend $rc
",
        disk = settings.disk_device,
        part = settings.root_partition,
        root_dev = settings.root_partition_device(),
        deregister = service.deregister_command(),
    );
    service
}

/// Print the WiFi address and SSH hint on the console. Runs every boot.
pub fn show_ip(settings: &ServiceSettings) -> OneShotService {
    let start_body = format!(
        "    ebegin \"Synchronizing system clock and checking IP address\"
    rc-service ntpd restart >/dev/null 2>&1 || true
    ip_addr=\"\"
    tries=0
    while [ $tries -lt {attempts} ]; do
        ip_addr=$(ip -4 -o addr show dev {iface} 2>/dev/null | awk '{{print $4}}' | cut -d/ -f1 | head -n 1)
        [ -n \"$ip_addr\" ] && break
        sleep {interval}
        tries=$((tries + 1))
    done
    {{
        printf '\\n\\n*************************************************************\\n'
        printf '* IP ADDRESS ({label}): %s\\n' \"${{ip_addr:-Not found}}\"
        printf '* SSH ENABLED (Dropbear): Login as root\\n'
        printf '*************************************************************\\n\\n'
    }} > {console}
    eend 0
",
        attempts = settings.ip_poll_attempts,
        iface = settings.wifi_interface,
        interval = settings.ip_poll_interval_secs,
        label = settings.wifi_interface.to_uppercase(),
        console = settings.console,
    );

    OneShotService {
        name: SHOW_IP.to_string(),
        description: "Display network IP address on the console.".to_string(),
        depends: vec![Dependency::Need("local".to_string())],
        runlevel: Runlevel::Default,
        policy: DeregisterPolicy::Never,
        start_body,
    }
}

/// Pick the fastest package mirror once the device is online.
///
/// No global address or no internet: warn and retry next boot. A failing
/// `setup-apkrepos` also leaves the service enabled.
pub fn setup_mirrors(settings: &ServiceSettings) -> OneShotService {
    let mut service = OneShotService {
        name: SETUP_MIRRORS.to_string(),
        description: "Finds and configures the fastest APK repositories.".to_string(),
        depends: vec![Dependency::After(SHOW_IP.to_string())],
        runlevel: Runlevel::Default,
        policy: DeregisterPolicy::OnSuccess,
        start_body: String::new(),
    };
    service.start_body = format!(
        "    ebegin \"Checking for active network connection\"
    if ! ip -o addr show scope global | grep -q \"inet\"; then
        ewarn \"No global IP address detected. Will retry next boot.\"
        eend 0
        return 0
    fi

    count=0
    while [ $count -lt {attempts} ]; do
        if ping -c 1 -W 1 {host} >/dev/null 2>&1; then
            break
        fi
        sleep {interval}
        count=$((count + 1))
    done
    if [ $count -ge {attempts} ]; then
        ewarn \"Internet unreachable. Will retry next boot.\"
        eend 0
        return 0
    fi

    ebegin \"Internet online, selecting the fastest APK mirror\"
    if setup-apkrepos -1 -c > {console} 2>&1; then
        einfo \"Mirrors configured successfully.\"
        {deregister}
        eend 0
    else
        eerror \"Failed to set up mirrors. Will retry next boot.\"
        eend 1
    fi
",
        attempts = settings.probe_attempts,
        host = settings.probe_host,
        interval = settings.probe_interval_secs,
        console = settings.console,
        deregister = service.deregister_command(),
    );
    service
}

/// All first-boot services, in install order.
pub fn all_services(settings: &ServiceSettings) -> Vec<OneShotService> {
    vec![resize_root(settings), show_ip(settings), setup_mirrors(settings)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Cmd;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resize_root_deregisters_unconditionally() {
        let service = resize_root(&ServiceSettings::default());
        let text = service.render();

        assert_eq!(service.policy, DeregisterPolicy::Unconditional);
        assert!(text.contains("    need localmount\n    before dbus\n"));
        assert!(text.contains("parted -s /dev/mmcblk0 resizepart 2 100% || true"));
        assert!(text.contains("resize2fs /dev/mmcblk0p2"));
        // rc-update del is not guarded by the resize result
        let del = text.find("rc-update del resize-root default").unwrap();
        assert!(del > text.find("resize2fs").unwrap());
        assert!(!text[..del].contains("if "));
    }

    #[test]
    fn test_show_ip_stays_enabled_and_polls_bounded() {
        let service = show_ip(&ServiceSettings::default());
        let text = service.render();

        assert_eq!(service.policy, DeregisterPolicy::Never);
        assert!(!text.contains("rc-update del"));
        assert!(text.contains("need local\n"));
        assert!(text.contains("while [ $tries -lt 10 ]"));
        assert!(text.contains("rc-service ntpd restart >/dev/null 2>&1 || true"));
        assert!(text.contains("* IP ADDRESS (WLAN0): %s"));
        assert!(text.contains("${ip_addr:-Not found}"));
        assert!(text.contains("* SSH ENABLED (Dropbear): Login as root"));
        assert!(text.contains("} > /dev/tty1"));
    }

    #[test]
    fn test_ip_poll_and_mirror_ping_intervals_are_independent() {
        let settings = ServiceSettings {
            probe_interval_secs: 7,
            ip_poll_interval_secs: 2,
            ..ServiceSettings::default()
        };
        let show = show_ip(&settings).render();
        let mirrors = setup_mirrors(&settings).render();

        assert!(show.contains("sleep 2\n"));
        assert!(!show.contains("sleep 7"));
        assert!(mirrors.contains("sleep 7\n"));
        assert!(!mirrors.contains("sleep 2"));
    }

    #[test]
    fn test_setup_mirrors_ping_and_conditional_deregister() {
        let service = setup_mirrors(&ServiceSettings::default());
        let text = service.render();

        assert_eq!(service.policy, DeregisterPolicy::OnSuccess);
        assert!(text.contains("after show-ip"));
        assert!(text.contains("while [ $count -lt 15 ]"));
        assert!(text.contains("ping -c 1 -W 1 8.8.8.8"));
        assert!(text.contains("sleep 1"));
        let run = text.find("if setup-apkrepos -1 -c").unwrap();
        let del = text.find("rc-update del setup-mirrors default").unwrap();
        let fail = text.find("eend 1").unwrap();
        assert!(run < del && del < fail);
    }

    #[test]
    fn test_all_services_install() {
        let temp = TempDir::new().unwrap();
        let services = super::super::install_all(temp.path(), &ServiceSettings::default()).unwrap();
        assert_eq!(services.len(), 3);
        for name in [RESIZE_ROOT, SHOW_IP, SETUP_MIRRORS] {
            assert!(temp.path().join("etc/init.d").join(name).is_file());
            assert!(temp.path().join("etc/runlevels/default").join(name).is_symlink());
        }
    }

    #[test]
    fn test_rendered_scripts_parse_as_shell() {
        if !crate::preflight::command_exists("sh") {
            return;
        }
        let temp = TempDir::new().unwrap();
        for service in all_services(&ServiceSettings::default()) {
            let path = temp.path().join(&service.name);
            fs::write(&path, service.render()).unwrap();
            Cmd::new("sh")
                .arg("-n")
                .arg_path(&path)
                .run()
                .unwrap_or_else(|e| panic!("{}: {e:#}", service.name));
        }
    }
}
