//! Minimal flattened device tree reader, enough to walk FIT images.

use thiserror::Error;

use super::{slice_at, u32_be_at};

pub const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;
const HEADER_LEN: usize = 40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FdtError {
    #[error("Invalid FDT magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("FDT is truncated at offset 0x{0:x}")]
    Truncated(usize),

    #[error("Unexpected FDT token {token} at offset 0x{offset:x}")]
    BadToken { token: u32, offset: usize },

    #[error("Invalid string at offset 0x{0:x}")]
    BadString(usize),
}

/// One device tree node with its properties, borrowed from the blob.
#[derive(Debug, Clone, Default)]
pub struct Node<'a> {
    pub name: &'a str,
    pub props: Vec<(&'a str, &'a [u8])>,
    pub children: Vec<Node<'a>>,
}

impl<'a> Node<'a> {
    pub fn prop(&self, name: &str) -> Option<&'a [u8]> {
        self.props.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn prop_u32(&self, name: &str) -> Option<u32> {
        self.prop(name).and_then(|v| u32_be_at(v, 0))
    }

    /// First string of a string property.
    pub fn prop_str(&self, name: &str) -> Option<&'a str> {
        self.prop_strlist(name).into_iter().next()
    }

    pub fn prop_strlist(&self, name: &str) -> Vec<&'a str> {
        self.prop(name)
            .map(|v| {
                v.split(|&b| b == 0)
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| std::str::from_utf8(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn child(&self, name: &str) -> Option<&Node<'a>> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Look up a descendant by a `/`-separated path relative to this node.
    pub fn find(&self, path: &str) -> Option<&Node<'a>> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }
}

#[derive(Debug, Clone)]
pub struct Fdt<'a> {
    total_size: u32,
    root: Node<'a>,
}

struct Walker<'a> {
    blob: &'a [u8],
    strings: &'a [u8],
    pos: usize,
}

impl<'a> Walker<'a> {
    fn token(&mut self) -> Result<u32, FdtError> {
        loop {
            let token = u32_be_at(self.blob, self.pos).ok_or(FdtError::Truncated(self.pos))?;
            self.pos += 4;
            if token != FDT_NOP {
                return Ok(token);
            }
        }
    }

    fn cstr(data: &'a [u8], offset: usize) -> Result<&'a str, FdtError> {
        let tail = data.get(offset..).ok_or(FdtError::BadString(offset))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::BadString(offset))?;
        std::str::from_utf8(&tail[..end]).map_err(|_| FdtError::BadString(offset))
    }

    fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    /// Parse the node whose BEGIN_NODE token was just consumed.
    fn node(&mut self) -> Result<Node<'a>, FdtError> {
        let name = Self::cstr(self.blob, self.pos)?;
        self.pos += name.len() + 1;
        self.align();
        let mut node = Node {
            name,
            ..Default::default()
        };
        loop {
            let at = self.pos;
            match self.token()? {
                FDT_PROP => {
                    let len = u32_be_at(self.blob, self.pos).ok_or(FdtError::Truncated(self.pos))? as usize;
                    let nameoff = u32_be_at(self.blob, self.pos + 4).ok_or(FdtError::Truncated(self.pos))? as usize;
                    self.pos += 8;
                    let value = slice_at(self.blob, self.pos, len).ok_or(FdtError::Truncated(self.pos))?;
                    self.pos += len;
                    self.align();
                    node.props.push((Self::cstr(self.strings, nameoff)?, value));
                }
                FDT_BEGIN_NODE => node.children.push(self.node()?),
                FDT_END_NODE => return Ok(node),
                token => return Err(FdtError::BadToken { token, offset: at }),
            }
        }
    }
}

impl<'a> Fdt<'a> {
    pub fn parse(blob: &'a [u8]) -> Result<Self, FdtError> {
        let field = |i: usize| u32_be_at(blob, i * 4).ok_or(FdtError::Truncated(i * 4));
        let magic = field(0)?;
        if magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(magic));
        }
        if blob.len() < HEADER_LEN {
            return Err(FdtError::Truncated(blob.len()));
        }
        let total_size = field(1)?;
        let off_struct = field(2)? as usize;
        let off_strings = field(3)? as usize;
        let size_strings = field(8)? as usize;
        let size_struct = field(9)? as usize;

        let strings = slice_at(blob, off_strings, size_strings).ok_or(FdtError::Truncated(off_strings))?;
        let structure = slice_at(blob, off_struct, size_struct).ok_or(FdtError::Truncated(off_struct))?;
        let mut walker = Walker {
            blob: structure,
            strings,
            pos: 0,
        };
        let root = match walker.token()? {
            FDT_BEGIN_NODE => walker.node()?,
            token => return Err(FdtError::BadToken { token, offset: off_struct }),
        };
        match walker.token()? {
            FDT_END => {}
            token => {
                return Err(FdtError::BadToken {
                    token,
                    offset: off_struct + walker.pos - 4,
                });
            }
        }
        Ok(Self { total_size, root })
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn root(&self) -> &Node<'a> {
        &self.root
    }

    pub fn find(&self, path: &str) -> Option<&Node<'a>> {
        self.root.find(path)
    }
}


#[cfg(test)]
mod tests {
    use super::builder::*;
    use super::*;

    #[test]
    fn test_walk_tree() {
        let blob = build(vec![
            str_prop("description", "test"),
            Item::Node(
                "images",
                vec![Item::Node(
                    "uboot",
                    vec![u32_prop("load", 0x4a00_0000), str_prop("os", "u-boot")],
                )],
            ),
            Item::Node(
                "configurations",
                vec![Item::Prop("loadables", b"uboot\0atf\0".to_vec())],
            ),
        ]);
        let fdt = Fdt::parse(&blob).unwrap();
        assert_eq!(fdt.total_size() as usize, blob.len());
        assert_eq!(fdt.root().prop_str("description"), Some("test"));
        let uboot = fdt.find("/images/uboot").unwrap();
        assert_eq!(uboot.prop_u32("load"), Some(0x4a00_0000));
        assert_eq!(uboot.prop_str("os"), Some("u-boot"));
        assert_eq!(
            fdt.find("configurations").unwrap().prop_strlist("loadables"),
            vec!["uboot", "atf"]
        );
        assert!(fdt.find("/images/missing").is_none());
    }

    #[test]
    fn test_rejects_damaged_blob() {
        let blob = build(vec![str_prop("a", "b")]);
        assert!(matches!(Fdt::parse(&blob[..30]), Err(FdtError::Truncated(_))));
        let mut bad = blob.clone();
        bad[0] = 0;
        assert!(matches!(Fdt::parse(&bad), Err(FdtError::BadMagic(_))));
        // Replace the root BEGIN_NODE token
        let mut bad = blob.clone();
        bad[HEADER_LEN + 16 + 3] = 7;
        assert!(matches!(Fdt::parse(&bad), Err(FdtError::BadToken { token: 7, .. })));
    }
}
