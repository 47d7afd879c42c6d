//! Built-in payloads used when no override file is supplied.

pub const INTERFACES: &str = "\
auto lo
iface lo inet loopback

auto wlan0
iface wlan0 inet dhcp
";

pub const HOSTNAME: &str = "alpine-pi\n";

/// Broadcom wireless driver for the on-board WiFi.
pub const MODULES: &str = "brcmfmac\n";

pub const FSTAB: &str = "\
/dev/mmcblk0p1 /boot vfat defaults 0 2
/dev/mmcblk0p2 /    ext4 defaults,noatime 0 1
";

pub const CMDLINE: &str = "modules=loop,squashfs,sd-mod,usb-storage quiet \
root=/dev/mmcblk0p2 rootfstype=ext4 console=serial0,115200 console=tty1 \
video=Composite-1:720x576@50ie\n";

pub const FIRMWARE_CONFIG: &str = "\
kernel=vmlinuz-rpi
initramfs initramfs-rpi
include usercfg.txt
dtoverlay=vc4-fkms-v3d,composite=1
dtoverlay=miniuart-max-clock=3000000
pi3-miniuart-freq=250000000
disable_overscan=1
sdtv_mode=2
sdtv_aspect=1
max_framebuffers=2
dtparam=audio=on
";

pub const INTERFACE_SETUP_SCRIPT: &str = r#"#!/bin/sh
# Bring up wlan0 through iwd.
# Usage: setup-interfaces-iwd.sh <ssid> [passphrase]
set -e

SSID="$1"
if [ -z "$SSID" ]; then
    echo "usage: $0 <ssid> [passphrase]" >&2
    exit 1
fi

rc-update add iwd default
rc-service iwd start
sleep 2

if [ -n "$2" ]; then
    iwctl --passphrase "$2" station wlan0 connect "$SSID"
else
    iwctl station wlan0 connect "$SSID"
fi

rc-service networking restart
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_end_with_newline() {
        for payload in [
            INTERFACES,
            HOSTNAME,
            MODULES,
            FSTAB,
            CMDLINE,
            FIRMWARE_CONFIG,
            INTERFACE_SETUP_SCRIPT,
        ] {
            assert!(payload.ends_with('\n'));
        }
    }

    #[test]
    fn test_cmdline_is_single_line_pointing_at_partition_two() {
        assert_eq!(CMDLINE.lines().count(), 1);
        assert!(CMDLINE.contains("root=/dev/mmcblk0p2 rootfstype=ext4"));
    }

    #[test]
    fn test_fstab_mounts_boot_and_root_noatime() {
        let lines: Vec<Vec<&str>> = FSTAB
            .lines()
            .map(|l| l.split_whitespace().collect())
            .collect();
        assert_eq!(lines[0], ["/dev/mmcblk0p1", "/boot", "vfat", "defaults", "0", "2"]);
        assert_eq!(lines[1], ["/dev/mmcblk0p2", "/", "ext4", "defaults,noatime", "0", "1"]);
    }
}
