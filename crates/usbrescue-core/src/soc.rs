//! Supported SoC models and their families.

use std::fmt;
use std::str::FromStr;

use crate::usb::UsbAddress;

/// SoC families, each with its own boot ROM protocol and recovery flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocFamily {
    Stm32mp,
    Imx,
    Sunxi,
    Am6x,
    Amlogic,
    Bcm,
    Rockchip,
    Sama5,
    Zynqmp,
    Keembay,
}

impl fmt::Display for SocFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocFamily::Stm32mp => "stm32mp",
            SocFamily::Imx => "imx",
            SocFamily::Sunxi => "sunxi",
            SocFamily::Am6x => "am6x",
            SocFamily::Amlogic => "amlogic",
            SocFamily::Bcm => "bcm",
            SocFamily::Rockchip => "rockchip",
            SocFamily::Sama5 => "sama5",
            SocFamily::Zynqmp => "zynqmp",
            SocFamily::Keembay => "keembay",
        };
        f.write_str(name)
    }
}

/// (model, family, default ROM USB id)
const MODELS: &[(&str, SocFamily, Option<(u16, u16)>)] = &[
    ("stm32mp13", SocFamily::Stm32mp, Some((0x0483, 0xdf11))),
    ("stm32mp15", SocFamily::Stm32mp, Some((0x0483, 0xdf11))),
    ("stm32mp25", SocFamily::Stm32mp, Some((0x0483, 0xdf11))),
    ("sama5d2", SocFamily::Sama5, Some((0x03eb, 0x6124))),
    ("sama5d3", SocFamily::Sama5, Some((0x03eb, 0x6124))),
    ("sama5d4", SocFamily::Sama5, Some((0x03eb, 0x6124))),
    ("a10", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a10s", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a13", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a20", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a23", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a31", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a33", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a64", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("a83t", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("h3", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("h5", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("h6", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("h616", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("r8", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("r40", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("v3s", SocFamily::Sunxi, Some((0x1f3a, 0xefe8))),
    ("am625", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am62a7", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am62d2", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am62p", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6442", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am654x", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am623", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6411", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6412", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6421", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6422", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6441", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("am6548", SocFamily::Am6x, Some((0x0451, 0x6162))),
    ("am6546", SocFamily::Am6x, Some((0x0451, 0x6162))),
    ("am62lx", SocFamily::Am6x, Some((0x0451, 0x6165))),
    ("zynqmp", SocFamily::Zynqmp, Some((0x03fd, 0x0050))),
    ("keembay", SocFamily::Keembay, Some((0x8087, 0x0b39))),
    ("imx8qxp", SocFamily::Imx, Some((0x1fc9, 0x012f))),
    ("imx8qm", SocFamily::Imx, Some((0x1fc9, 0x0129))),
    ("imx8dxl", SocFamily::Imx, Some((0x1fc9, 0x0147))),
    ("imx28", SocFamily::Imx, Some((0x15a2, 0x004f))),
    ("imx815", SocFamily::Imx, Some((0x1fc9, 0x013e))),
    ("imx865", SocFamily::Imx, Some((0x1fc9, 0x0146))),
    ("imx91", SocFamily::Imx, Some((0x1fc9, 0x0159))),
    ("imx93", SocFamily::Imx, Some((0x1fc9, 0x014e))),
    ("imx7d", SocFamily::Imx, Some((0x15a2, 0x0076))),
    ("imx6q", SocFamily::Imx, Some((0x15a2, 0x0054))),
    ("imx6d", SocFamily::Imx, Some((0x15a2, 0x0061))),
    ("imx6sl", SocFamily::Imx, Some((0x15a2, 0x0063))),
    ("imx6sx", SocFamily::Imx, Some((0x15a2, 0x0071))),
    ("imx6ul", SocFamily::Imx, Some((0x15a2, 0x007d))),
    ("imx6ull", SocFamily::Imx, Some((0x15a2, 0x0080))),
    ("imx6sll", SocFamily::Imx, Some((0x1fc9, 0x0128))),
    ("imx7ulp", SocFamily::Imx, Some((0x1fc9, 0x0126))),
    ("imxrt106x", SocFamily::Imx, Some((0x1fc9, 0x0135))),
    ("imx8mm", SocFamily::Imx, Some((0x1fc9, 0x0134))),
    ("imx8mq", SocFamily::Imx, Some((0x1fc9, 0x012b))),
    ("imx53", SocFamily::Imx, Some((0x15a2, 0x004e))),
    ("bcm2711", SocFamily::Bcm, Some((0x0a5c, 0x2711))),
    ("bcm2712", SocFamily::Bcm, Some((0x0a5c, 0x2712))),
    ("s905d2", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905y2", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905x2", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("a311d", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s922x", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905x3", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905d3", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905d", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905x", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905w", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905l", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905m2", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s805x", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s805y", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s912", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905h", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("s905m", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("a113x", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    ("a113d", SocFamily::Amlogic, Some((0x1b8e, 0xc003))),
    // Rockchip mask ROM IDs differ per part, the address must be given.
    ("px30", SocFamily::Rockchip, None),
    ("rk3036", SocFamily::Rockchip, None),
    ("rk3128", SocFamily::Rockchip, None),
    ("rk3188", SocFamily::Rockchip, None),
    ("rk3288", SocFamily::Rockchip, None),
    ("rk3308", SocFamily::Rockchip, None),
    ("rk3328", SocFamily::Rockchip, None),
    ("rk3399", SocFamily::Rockchip, None),
    ("rk3506", SocFamily::Rockchip, None),
    ("rk3506b", SocFamily::Rockchip, None),
    ("rk3528", SocFamily::Rockchip, None),
    ("rk3562", SocFamily::Rockchip, None),
    ("rk3566", SocFamily::Rockchip, None),
    ("rk3568", SocFamily::Rockchip, None),
    ("rk3576", SocFamily::Rockchip, None),
    ("rk3583", SocFamily::Rockchip, None),
    ("rk3588", SocFamily::Rockchip, None),
    ("rv1103b", SocFamily::Rockchip, None),
    ("rv1106", SocFamily::Rockchip, None),
];

/// A supported SoC model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocModel {
    name: &'static str,
    family: SocFamily,
    rom_usb: Option<(u16, u16)>,
}

impl SocModel {
    pub fn lookup(name: &str) -> Option<Self> {
        MODELS
            .iter()
            .find(|(model, _, _)| model.eq_ignore_ascii_case(name))
            .map(|&(name, family, rom_usb)| SocModel {
                name,
                family,
                rom_usb,
            })
    }

    pub fn all() -> impl Iterator<Item = SocModel> {
        MODELS.iter().map(|&(name, family, rom_usb)| SocModel {
            name,
            family,
            rom_usb,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn family(&self) -> SocFamily {
        self.family
    }

    /// USB ID the boot ROM enumerates with, when it is fixed for the model.
    pub fn default_usb(&self) -> Option<UsbAddress> {
        self.rom_usb.map(|(vid, pid)| UsbAddress::Ids { vid, pid })
    }

    pub fn is(&self, names: &[&str]) -> bool {
        names.contains(&self.name)
    }
}

impl fmt::Display for SocModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl FromStr for SocModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocModel::lookup(s).ok_or_else(|| format!("unsupported SoC model '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_family_and_ids() {
        let soc = SocModel::lookup("stm32mp15").unwrap();
        assert_eq!(soc.family(), SocFamily::Stm32mp);
        assert_eq!(soc.default_usb().unwrap().to_string(), "0483:df11");

        let am65 = SocModel::lookup("am6548").unwrap();
        assert_eq!(am65.default_usb().unwrap().to_string(), "0451:6162");
    }

    #[test]
    fn test_rockchip_has_no_default_ids() {
        let soc: SocModel = "rk3399".parse().unwrap();
        assert_eq!(soc.family(), SocFamily::Rockchip);
        assert!(soc.default_usb().is_none());
    }

    #[test]
    fn test_unknown_model() {
        assert!("pentium".parse::<SocModel>().is_err());
    }
}
