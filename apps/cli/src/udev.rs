//! Device access rules and the guidance printed when USB access is denied.

use std::fmt::Write as _;

use anyhow::Error;
use usbrescue_core::{SocModel, UsbAddress, UsbError};

/// Vendor ids of the gadgets U-Boot exposes once a board is recovered
/// (DFU, fastboot, mass storage) on the supported boards.
const GADGET_VENDORS: &[(u16, &str)] = &[
    (0x0483, "STMicroelectronics U-Boot gadgets"),
    (0x0451, "Texas Instruments U-Boot gadgets"),
    (0x1b67, "NXP U-Boot gadgets"),
    (0x03eb, "Microchip U-Boot gadgets"),
    (0x2207, "Rockchip U-Boot gadgets"),
    (0x1d6b, "Generic U-Boot gadgets"),
];

/// udev rules granting the logged-in user access to every ROM device the
/// tool knows about.
pub fn rules() -> String {
    let mut ids: Vec<(u16, u16, Vec<&str>)> = Vec::new();
    for soc in SocModel::all() {
        let Some(UsbAddress::Ids { vid, pid }) = soc.default_usb() else {
            continue;
        };
        match ids.iter_mut().find(|(v, p, _)| *v == vid && *p == pid) {
            Some((_, _, models)) => models.push(soc.name()),
            None => ids.push((vid, pid, vec![soc.name()])),
        }
    }

    let mut out = String::from("# usbrescue udev rules\n");
    for (vid, pid, models) in &ids {
        let _ = writeln!(out, "\n# {}", models.join(", "));
        let _ = writeln!(
            out,
            "SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{:04x}\", ATTRS{{idProduct}}==\"{:04x}\", MODE=\"0660\", TAG+=\"uaccess\"",
            vid, pid
        );
    }
    for (vid, what) in GADGET_VENDORS {
        let _ = writeln!(out, "\n# {}", what);
        let _ = writeln!(
            out,
            "SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{:04x}\", MODE=\"0660\", TAG+=\"uaccess\"",
            vid
        );
    }
    out
}

/// The permission failure buried in `err`, if that is what stopped us.
pub fn permission_denied(err: &Error) -> Option<&str> {
    err.chain().find_map(|cause| match cause.downcast_ref::<UsbError>() {
        Some(UsbError::PermissionDenied { path }) => Some(path.as_str()),
        _ => None,
    })
}

/// What to tell the operator about a device they may not open.
pub fn guidance(path: &str) -> String {
    if cfg!(windows) {
        format!(
            "Access to USB device {} was denied.\n\
             Bind the device to the WinUSB driver (for example with Zadig) and retry.",
            path
        )
    } else {
        format!(
            "Access to USB device {} was denied.\n\
             Install udev rules granting access to it:\n\n\
             \tusbrescue udev > /etc/udev/rules.d/50-usbrescue.rules\n\
             \tudevadm control --reload-rules && udevadm trigger\n\n\
             then unplug and replug the board.",
            path
        )
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_rules_cover_rom_ids_once() {
        let rules = rules();
        let stm32 = "ATTRS{idVendor}==\"0483\", ATTRS{idProduct}==\"df11\"";
        assert_eq!(rules.matches(stm32).count(), 1);
        assert!(rules.contains("stm32mp13"));
        assert!(rules.contains("ATTRS{idVendor}==\"1f3a\", ATTRS{idProduct}==\"efe8\""));
        assert!(rules.lines().filter(|l| l.starts_with("SUBSYSTEM")).all(|l| l.contains("uaccess")));
    }

    #[test]
    fn test_permission_denied_found_under_context() {
        let err = Err::<(), _>(UsbError::PermissionDenied {
            path: "3-1.2".to_string(),
        })
        .context("stm32mp15 recovery failed during Rom")
        .unwrap_err();
        assert_eq!(permission_denied(&err), Some("3-1.2"));

        let other = anyhow::Error::new(UsbError::NotFound("0483:df11".to_string()));
        assert_eq!(permission_denied(&other), None);
    }
}
