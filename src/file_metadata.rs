// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extended file attributes from the PE version resource.
//!
//! File attribute rules constrain descriptive metadata carried in a PE's
//! `VS_VERSIONINFO` resource. This module parses that resource directly
//! from the file bytes: the fixed file info block supplies the binary file
//! version, the string tables supply original filename, file description,
//! internal name and product name.

use {
    crate::error::AppControlSimError,
    scroll::Pread,
    std::{cmp::Ordering, fmt, path::Path, str::FromStr},
};

const FIXED_FILE_INFO_SIGNATURE: u32 = 0xfeef_04bd;

/// A four-part file version, ordered component-wise.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl FileVersion {
    pub fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    fn as_tuple(&self) -> (u16, u16, u16, u16) {
        (self.major, self.minor, self.build, self.revision)
    }
}

impl Ord for FileVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_tuple().cmp(&other.as_tuple())
    }
}

impl PartialOrd for FileVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl FromStr for FileVersion {
    type Err = AppControlSimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u16; 4];
        let mut count = 0;

        for part in s.split('.') {
            if count == 4 {
                return Err(AppControlSimError::MalformedPolicy(format!(
                    "version {} has more than 4 components",
                    s
                )));
            }

            parts[count] = part.trim().parse::<u16>().map_err(|_| {
                AppControlSimError::MalformedPolicy(format!("bad version component in {}", s))
            })?;
            count += 1;
        }

        if count == 0 {
            return Err(AppControlSimError::MalformedPolicy(
                "empty version string".into(),
            ));
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            build: parts[2],
            revision: parts[3],
        })
    }
}

/// Descriptive metadata extracted from a file's version resource.
///
/// All fields are absent for files without a `VS_VERSIONINFO` resource.
#[derive(Clone, Debug, Default)]
pub struct ExtendedFileInfo {
    pub original_file_name: Option<String>,
    pub file_description: Option<String>,
    pub internal_name: Option<String>,
    pub product_name: Option<String>,
    pub file_version: Option<FileVersion>,
}

impl ExtendedFileInfo {
    pub fn from_file(path: &Path) -> Result<Self, AppControlSimError> {
        let data = std::fs::read(path)?;

        Ok(Self::from_data(&data))
    }

    /// Parse the version resource out of raw file bytes.
    ///
    /// The resource is located by its UTF-16 `VS_VERSION_INFO` key rather
    /// than by walking the resource directory, which tolerates truncated or
    /// unconventional resource sections. Absent or unparseable resources
    /// yield an empty result, never an error.
    pub fn from_data(data: &[u8]) -> Self {
        let start = match find_version_info(data) {
            Some(start) => start,
            None => return Self::default(),
        };

        let mut info = Self::default();

        if let Some(root) = Block::parse(data, start) {
            if root.value_length as usize >= 52 {
                info.file_version = fixed_file_version(data, root.value_offset);
            }

            let mut offset = align4(root.value_offset + root.value_length as usize);

            while offset + 6 <= root.end {
                let child = match Block::parse(data, offset) {
                    Some(child) => child,
                    None => break,
                };

                if child.key == "StringFileInfo" {
                    collect_string_tables(data, &child, &mut info);
                }

                offset = align4(child.end);
            }
        }

        info
    }

    /// The value for one file name criteria field, if present.
    pub fn field(&self, criteria: crate::policy::FileNameCriteria) -> Option<&str> {
        use crate::policy::FileNameCriteria::*;

        match criteria {
            OriginalFileName => self.original_file_name.as_deref(),
            FileDescription => self.file_description.as_deref(),
            InternalName => self.internal_name.as_deref(),
            ProductName => self.product_name.as_deref(),
        }
    }
}

/// One version resource block header plus its decoded key.
struct Block {
    value_length: u16,
    key: String,
    /// Offset of the value area, 4-byte aligned past the key.
    value_offset: usize,
    /// Offset one past the end of this block.
    end: usize,
}

impl Block {
    fn parse(data: &[u8], offset: usize) -> Option<Self> {
        let length: u16 = data.pread_with(offset, scroll::LE).ok()?;
        let value_length: u16 = data.pread_with(offset + 2, scroll::LE).ok()?;

        if length < 6 {
            return None;
        }

        let end = (offset + length as usize).min(data.len());

        let (key, key_end) = read_utf16z(data, offset + 6, end)?;

        Some(Self {
            value_length,
            key,
            value_offset: align4(key_end),
            end,
        })
    }
}

fn find_version_info(data: &[u8]) -> Option<usize> {
    let marker = "VS_VERSION_INFO"
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect::<Vec<_>>();

    data.windows(marker.len())
        .position(|w| w == marker.as_slice())
        .and_then(|pos| pos.checked_sub(6))
}

fn fixed_file_version(data: &[u8], offset: usize) -> Option<FileVersion> {
    let signature: u32 = data.pread_with(offset, scroll::LE).ok()?;

    if signature != FIXED_FILE_INFO_SIGNATURE {
        return None;
    }

    let ms: u32 = data.pread_with(offset + 8, scroll::LE).ok()?;
    let ls: u32 = data.pread_with(offset + 12, scroll::LE).ok()?;

    Some(FileVersion::new(
        (ms >> 16) as u16,
        (ms & 0xffff) as u16,
        (ls >> 16) as u16,
        (ls & 0xffff) as u16,
    ))
}

fn collect_string_tables(data: &[u8], string_file_info: &Block, info: &mut ExtendedFileInfo) {
    let mut table_offset = string_file_info.value_offset;

    while table_offset + 6 <= string_file_info.end {
        let table = match Block::parse(data, table_offset) {
            Some(table) => table,
            None => break,
        };

        let mut entry_offset = table.value_offset;

        while entry_offset + 6 <= table.end {
            let entry = match Block::parse(data, entry_offset) {
                Some(entry) => entry,
                None => break,
            };

            if let Some((value, _)) = read_utf16z(data, entry.value_offset, entry.end) {
                let value = value.trim().to_string();

                if !value.is_empty() {
                    match entry.key.to_ascii_lowercase().as_str() {
                        "originalfilename" => info.original_file_name = Some(value),
                        "filedescription" => info.file_description = Some(value),
                        "internalname" => info.internal_name = Some(value),
                        "productname" => info.product_name = Some(value),
                        _ => {}
                    }
                }
            }

            entry_offset = align4(entry.end);
        }

        table_offset = align4(table.end);
    }
}

/// Decode a NUL-terminated UTF-16LE string starting at `offset`, bounded by
/// `end`. Returns the string and the offset just past the terminator.
fn read_utf16z(data: &[u8], offset: usize, end: usize) -> Option<(String, usize)> {
    let mut units = vec![];
    let mut pos = offset;

    while pos + 2 <= end.min(data.len()) {
        let unit: u16 = data.pread_with(pos, scroll::LE).ok()?;
        pos += 2;

        if unit == 0 {
            return Some((String::from_utf16_lossy(&units), pos));
        }

        units.push(unit);
    }

    None
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}
