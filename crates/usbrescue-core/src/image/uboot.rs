//! U-Boot images: legacy `mkimage` images and FIT images.
//!
//! Both are reduced to a list of [`LoadSegment`]s to copy into target
//! memory plus an entry point, so a loader only needs `MemoryOps`.

use thiserror::Error;
use tracing::{debug, warn};

use super::fdt::{FDT_MAGIC, Fdt, FdtError, Node};
use super::{slice_at, u32_be_at};

pub const LEGACY_MAGIC: u32 = 0x2705_1956;
pub const LEGACY_HEADER_LEN: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UbootImageError {
    #[error("Unknown U-Boot image magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("U-Boot image is truncated")]
    Truncated,

    #[error("Invalid header checksum: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    HeaderCrc { stored: u32, computed: u32 },

    #[error("Invalid data checksum: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    DataCrc { stored: u32, computed: u32 },

    #[error("No valid configuration node found in FIT")]
    NoConfiguration,

    #[error("FIT node '{node}' has no '{prop}' property")]
    MissingProperty { node: String, prop: &'static str },

    #[error("FIT image node '{0}' not found")]
    MissingImage(String),

    #[error("FIT image '{name}' data 0x{offset:x}+0x{size:x} lies outside the file")]
    DataOutOfRange { name: String, offset: usize, size: usize },

    #[error(transparent)]
    Fdt(#[from] FdtError),
}

/// Bytes to copy to `addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment<'a> {
    pub name: String,
    pub addr: u32,
    pub data: &'a [u8],
}

/// What to load and where to jump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan<'a> {
    pub segments: Vec<LoadSegment<'a>>,
    pub entry: Option<u32>,
    /// Entry point expects AArch64 state.
    pub arm64: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyImage<'a> {
    pub name: String,
    pub load: u32,
    pub entry: u32,
    pub os: u8,
    pub arch: u8,
    pub kind: u8,
    pub comp: u8,
    pub data: &'a [u8],
}

impl<'a> LegacyImage<'a> {
    /// Parse and verify an image. The header checksum is checked first,
    /// with its own field zeroed, then the data checksum.
    pub fn parse(blob: &'a [u8]) -> Result<Self, UbootImageError> {
        let header = slice_at(blob, 0, LEGACY_HEADER_LEN).ok_or(UbootImageError::Truncated)?;
        let be = |off: usize| u32_be_at(header, off).ok_or(UbootImageError::Truncated);
        let magic = be(0)?;
        if magic != LEGACY_MAGIC {
            return Err(UbootImageError::BadMagic(magic));
        }

        let stored = be(4)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[..4]);
        hasher.update(&[0u8; 4]);
        hasher.update(&header[8..]);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(UbootImageError::HeaderCrc { stored, computed });
        }

        let size = be(12)? as usize;
        let data = slice_at(blob, LEGACY_HEADER_LEN, size).ok_or(UbootImageError::Truncated)?;
        let stored = be(24)?;
        let computed = crc32fast::hash(data);
        if stored != computed {
            return Err(UbootImageError::DataCrc { stored, computed });
        }

        let name = &header[32..];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(Self {
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
            load: be(16)?,
            entry: be(20)?,
            os: header[28],
            arch: header[29],
            kind: header[30],
            comp: header[31],
            data,
        })
    }

    /// The whole payload goes to the load address, which is also where
    /// execution starts.
    pub fn plan(&self) -> LoadPlan<'a> {
        LoadPlan {
            segments: vec![LoadSegment {
                name: self.name.clone(),
                addr: self.load,
                data: self.data,
            }],
            entry: Some(self.load),
            arm64: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitImage<'a> {
    blob: &'a [u8],
    fdt: Fdt<'a>,
}

impl<'a> FitImage<'a> {
    pub fn parse(blob: &'a [u8]) -> Result<Self, UbootImageError> {
        Ok(Self {
            blob,
            fdt: Fdt::parse(blob)?,
        })
    }

    pub fn fdt(&self) -> &Fdt<'a> {
        &self.fdt
    }

    /// The configuration whose `description` equals `dt_name`, else the
    /// default one.
    pub fn configuration(&self, dt_name: Option<&str>) -> Result<&Node<'a>, UbootImageError> {
        let cfgs = self
            .fdt
            .find("/configurations")
            .ok_or(UbootImageError::NoConfiguration)?;
        if let Some(dt_name) = dt_name {
            if let Some(cfg) = cfgs
                .children
                .iter()
                .find(|c| c.prop_str("description") == Some(dt_name))
            {
                return Ok(cfg);
            }
        }
        cfgs.prop_str("default")
            .and_then(|name| cfgs.child(name))
            .ok_or(UbootImageError::NoConfiguration)
    }

    fn image(&self, name: &str) -> Result<&Node<'a>, UbootImageError> {
        self.fdt
            .find("/images")
            .and_then(|images| images.child(name))
            .ok_or_else(|| UbootImageError::MissingImage(name.to_string()))
    }

    /// Image payload, either embedded (`data`) or stored after the tree
    /// (`data-offset`/`data-size`, relative to the word aligned tree end).
    fn image_data(&self, node: &Node<'a>) -> Result<Option<&'a [u8]>, UbootImageError> {
        if let (Some(offset), Some(size)) = (node.prop_u32("data-offset"), node.prop_u32("data-size")) {
            let base = (self.fdt.total_size() as usize + 3) & !3;
            let offset = base + offset as usize;
            let size = size as usize;
            debug!(image = node.name, offset, size, "Image is outside FIT");
            return slice_at(self.blob, offset, size)
                .map(Some)
                .ok_or_else(|| UbootImageError::DataOutOfRange {
                    name: node.name.to_string(),
                    offset,
                    size,
                });
        }
        Ok(node.prop("data"))
    }

    /// Loadables then firmware, each at its `load` address. The first
    /// image with an `entry` gives the entry point. When a `u-boot` image
    /// is present the configuration's fdt is placed right after it.
    pub fn plan(&self, dt_name: Option<&str>) -> Result<LoadPlan<'a>, UbootImageError> {
        let config = self.configuration(dt_name)?;
        let mut names = config.prop_strlist("loadables");
        names.extend(config.prop_str("firmware"));

        let mut plan = LoadPlan {
            segments: Vec::new(),
            entry: None,
            arm64: false,
        };
        let mut dtb_addr = None;
        for name in names {
            let node = self.image(name)?;
            let addr = node.prop_u32("load").ok_or_else(|| UbootImageError::MissingProperty {
                node: name.to_string(),
                prop: "load",
            })?;
            let Some(data) = self.image_data(node)? else {
                warn!(image = name, "Empty image, skipping");
                continue;
            };
            if plan.entry.is_none() {
                if let Some(entry) = node.prop_u32("entry") {
                    plan.entry = Some(entry);
                    plan.arm64 = node.prop_str("arch") == Some("arm64");
                }
            }
            if node.prop_str("os") == Some("u-boot") {
                dtb_addr = addr.checked_add(data.len() as u32);
            }
            plan.segments.push(LoadSegment {
                name: name.to_string(),
                addr,
                data,
            });
        }

        match dtb_addr {
            None => warn!("No DTB address found"),
            Some(addr) => {
                let fdt_name = config.prop_str("fdt").ok_or_else(|| UbootImageError::MissingProperty {
                    node: config.name.to_string(),
                    prop: "fdt",
                })?;
                let node = self.image(fdt_name)?;
                if let Some(data) = self.image_data(node)? {
                    plan.segments.push(LoadSegment {
                        name: fdt_name.to_string(),
                        addr,
                        data,
                    });
                }
            }
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone)]
pub enum UbootImage<'a> {
    Legacy(LegacyImage<'a>),
    Fit(FitImage<'a>),
}

impl<'a> UbootImage<'a> {
    /// Detect the format from the leading magic.
    pub fn parse(blob: &'a [u8]) -> Result<Self, UbootImageError> {
        match u32_be_at(blob, 0).ok_or(UbootImageError::Truncated)? {
            FDT_MAGIC => Ok(Self::Fit(FitImage::parse(blob)?)),
            LEGACY_MAGIC => Ok(Self::Legacy(LegacyImage::parse(blob)?)),
            other => Err(UbootImageError::BadMagic(other)),
        }
    }

    pub fn plan(&self, dt_name: Option<&str>) -> Result<LoadPlan<'a>, UbootImageError> {
        match self {
            Self::Legacy(img) => Ok(img.plan()),
            Self::Fit(fit) => fit.plan(dt_name),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image::fdt::builder::*;

    pub(crate) fn legacy(payload: &[u8]) -> Vec<u8> {
        let mut h = vec![0u8; LEGACY_HEADER_LEN];
        h[0..4].copy_from_slice(&LEGACY_MAGIC.to_be_bytes());
        h[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        h[16..20].copy_from_slice(&0x4a00_0000u32.to_be_bytes());
        h[20..24].copy_from_slice(&0x4a00_0040u32.to_be_bytes());
        h[24..28].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
        h[28] = 17;
        h[32..38].copy_from_slice(b"U-Boot");
        let hcrc = crc32fast::hash(&h);
        h[4..8].copy_from_slice(&hcrc.to_be_bytes());
        h.extend_from_slice(payload);
        h
    }

    #[test]
    fn test_legacy_image() {
        let blob = legacy(b"payload!");
        let img = LegacyImage::parse(&blob).unwrap();
        assert_eq!(img.name, "U-Boot");
        assert_eq!(img.os, 17);
        let plan = img.plan();
        assert_eq!(plan.entry, Some(0x4a00_0000));
        assert_eq!(plan.segments[0].data, b"payload!");
    }

    #[test]
    fn test_header_crc_checked_first() {
        let mut blob = legacy(b"payload!");
        // Break both checksums; the header one must be reported
        blob[40] ^= 0xff;
        blob[LEGACY_HEADER_LEN] ^= 0xff;
        assert!(matches!(
            LegacyImage::parse(&blob),
            Err(UbootImageError::HeaderCrc { .. })
        ));
    }

    #[test]
    fn test_data_crc() {
        let mut blob = legacy(b"payload!");
        blob[LEGACY_HEADER_LEN + 3] ^= 0x01;
        assert!(matches!(
            UbootImage::parse(&blob),
            Err(UbootImageError::DataCrc { .. })
        ));
    }

    /// FIT with an arm64 `atf` firmware and a `uboot` loadable.
    pub(crate) fn fit(external: bool) -> Vec<u8> {
        let uboot_data = if external {
            vec![u32_prop("data-offset", 0), u32_prop("data-size", 8)]
        } else {
            vec![Item::Prop("data", b"UBOOTBIN".to_vec())]
        };
        let mut uboot = vec![
            u32_prop("load", 0x4a00_0000),
            str_prop("os", "u-boot"),
            str_prop("arch", "arm64"),
        ];
        uboot.extend(uboot_data);
        let mut blob = build(vec![
            Item::Node(
                "images",
                vec![
                    Item::Node("uboot", uboot),
                    Item::Node(
                        "atf",
                        vec![
                            u32_prop("load", 0x44000),
                            u32_prop("entry", 0x44000),
                            str_prop("arch", "arm64"),
                            Item::Prop("data", b"BL31".to_vec()),
                        ],
                    ),
                    Item::Node("fdt-1", vec![Item::Prop("data", b"DTB!".to_vec())]),
                    Item::Node("fdt-2", vec![Item::Prop("data", b"DTB2".to_vec())]),
                ],
            ),
            Item::Node(
                "configurations",
                vec![
                    str_prop("default", "config-1"),
                    Item::Node(
                        "config-1",
                        vec![
                            str_prop("description", "board-a"),
                            str_prop("firmware", "atf"),
                            str_prop("loadables", "uboot"),
                            str_prop("fdt", "fdt-1"),
                        ],
                    ),
                    Item::Node(
                        "config-2",
                        vec![
                            str_prop("description", "board-b"),
                            str_prop("firmware", "atf"),
                            str_prop("loadables", "uboot"),
                            str_prop("fdt", "fdt-2"),
                        ],
                    ),
                ],
            ),
        ]);
        if external {
            blob.resize((blob.len() + 3) & !3, 0);
            blob.extend_from_slice(b"UBOOTBIN");
        }
        blob
    }

    #[test]
    fn test_fit_plan() {
        for external in [false, true] {
            let blob = fit(external);
            let img = UbootImage::parse(&blob).unwrap();
            let plan = img.plan(None).unwrap();
            let names: Vec<_> = plan.segments.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["uboot", "atf", "fdt-1"]);
            assert_eq!(plan.segments[0].data, b"UBOOTBIN");
            assert_eq!(plan.segments[2].addr, 0x4a00_0008);
            assert_eq!(plan.entry, Some(0x44000));
            assert!(plan.arm64);
        }
    }

    #[test]
    fn test_fit_config_by_description() {
        let blob = fit(false);
        let plan = UbootImage::parse(&blob).unwrap().plan(Some("board-b")).unwrap();
        assert_eq!(plan.segments[2].data, b"DTB2");
        let plan = UbootImage::parse(&blob).unwrap().plan(Some("unknown")).unwrap();
        assert_eq!(plan.segments[2].data, b"DTB!");
    }

    #[test]
    fn test_fit_external_data_out_of_range() {
        let mut blob = fit(true);
        blob.truncate(blob.len() - 4);
        assert!(matches!(
            UbootImage::parse(&blob).unwrap().plan(None),
            Err(UbootImageError::DataOutOfRange { .. })
        ));
    }
}
