// Copyright 2024 trunkfs
//
// FastDFS, Copyright 2008 Happy Fish / YuQing
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk slot header. Every slot in a trunk file starts with a fixed
//! size header immediately preceding the payload bytes; the payload of a
//! logical file therefore begins at `slot_offset + TRUNK_HEADER_SIZE`.

use byteorder::{BigEndian, ByteOrder};
use trunkfs_common::EXT_NAME_MAX_LEN;

const FILE_TYPE_OFFSET: usize = 0;
const ALLOC_SIZE_OFFSET: usize = 1;
const FILE_SIZE_OFFSET: usize = 5;
const CRC32_OFFSET: usize = 9;
const MTIME_OFFSET: usize = 13;
const EXT_NAME_OFFSET: usize = 17;

/// Bytes reserved for the formatted extension name, including its
/// trailing NUL.
pub const EXT_NAME_BYTES: usize = EXT_NAME_MAX_LEN + 1;

pub const TRUNK_HEADER_SIZE: usize = EXT_NAME_OFFSET + EXT_NAME_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TrunkFileType {
    /// Slot is not occupied by any logical file.
    #[default]
    None = 0,
    Regular = b'F',
    Link = b'L',
}

impl TrunkFileType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'F' => TrunkFileType::Regular,
            b'L' => TrunkFileType::Link,
            _ => TrunkFileType::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkHeader {
    pub file_type: TrunkFileType,
    /// Allocated slot size, header included.
    pub alloc_size: u32,
    /// Actual payload length of the logical file.
    pub file_size: u32,
    pub crc32: u32,
    pub mtime: u32,
    /// Right-padded with NULs.
    pub formatted_ext_name: [u8; EXT_NAME_BYTES],
}

impl Default for TrunkHeader {
    fn default() -> Self {
        Self {
            file_type: TrunkFileType::None,
            alloc_size: 0,
            file_size: 0,
            crc32: 0,
            mtime: 0,
            formatted_ext_name: [0; EXT_NAME_BYTES],
        }
    }
}

impl TrunkHeader {
    pub fn pack(&self) -> [u8; TRUNK_HEADER_SIZE] {
        let mut buff = [0u8; TRUNK_HEADER_SIZE];
        buff[FILE_TYPE_OFFSET] = self.file_type as u8;
        BigEndian::write_u32(&mut buff[ALLOC_SIZE_OFFSET..], self.alloc_size);
        BigEndian::write_u32(&mut buff[FILE_SIZE_OFFSET..], self.file_size);
        BigEndian::write_u32(&mut buff[CRC32_OFFSET..], self.crc32);
        BigEndian::write_u32(&mut buff[MTIME_OFFSET..], self.mtime);
        buff[EXT_NAME_OFFSET..].copy_from_slice(&self.formatted_ext_name);
        buff
    }

    pub fn unpack(buff: &[u8; TRUNK_HEADER_SIZE]) -> Self {
        let mut formatted_ext_name = [0u8; EXT_NAME_BYTES];
        formatted_ext_name.copy_from_slice(&buff[EXT_NAME_OFFSET..]);
        Self {
            file_type: TrunkFileType::from_byte(buff[FILE_TYPE_OFFSET]),
            alloc_size: BigEndian::read_u32(&buff[ALLOC_SIZE_OFFSET..]),
            file_size: BigEndian::read_u32(&buff[FILE_SIZE_OFFSET..]),
            crc32: BigEndian::read_u32(&buff[CRC32_OFFSET..]),
            mtime: BigEndian::read_u32(&buff[MTIME_OFFSET..]),
            formatted_ext_name,
        }
    }

    /// Copy `ext_name` into the fixed-size formatted field, truncating to
    /// [`EXT_NAME_MAX_LEN`] bytes.
    pub fn set_ext_name(&mut self, ext_name: &str) {
        self.formatted_ext_name = [0; EXT_NAME_BYTES];
        let bytes = ext_name.as_bytes();
        let len = bytes.len().min(EXT_NAME_MAX_LEN);
        self.formatted_ext_name[..len].copy_from_slice(&bytes[..len]);
    }
}

/// Whether a raw header marks an unoccupied slot.
///
/// A slot that was never written is all zeroes; a deleted slot keeps its
/// `alloc_size` (and the delete path only rewrites type and sizes), so
/// those three fields are scrubbed before comparing against the zero
/// sentinel. Anything left over means a live logical file owns the slot.
pub fn is_free_slot(buff: &[u8; TRUNK_HEADER_SIZE]) -> bool {
    if buff.iter().all(|b| *b == 0) {
        return true;
    }

    let mut scrubbed = TrunkHeader::unpack(buff);
    scrubbed.file_type = TrunkFileType::None;
    scrubbed.alloc_size = 0;
    scrubbed.file_size = 0;
    scrubbed.pack().iter().all(|b| *b == 0)
}
