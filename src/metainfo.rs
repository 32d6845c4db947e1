//! Parsing of `.torrent` metadata files.

use std::convert::TryInto;
use std::fs;
use std::path::{Component, Path, PathBuf};

use bendy::decoding::{Error as DecodingError, FromBencode, Object, ResultExt};
use bendy::encoding::{AsString, Error as EncodingError, SingleItemEncoder, ToBencode};

use crate::disk::FileEntry;
use crate::error::{Error, Result};
use crate::piece::PieceDescriptor;
use crate::util::{InfoHash, ShaHash, SHA_HASH_LEN};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetaInfo {
    /// url of the tracker
    pub announce: Option<String>,
    /// tracker tiers flattened in order, takes precedence over `announce`
    pub announce_list: Vec<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub info: TorrentInfo,
    /// the SHA-1 of the raw bencoded `info` dictionary
    pub info_hash: InfoHash,
}

impl MetaInfo {
    /// Parses and validates bencoded metadata.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let meta = Self::from_bencode(data)?;
        meta.info.validate()?;
        Ok(meta)
    }

    pub fn from_torrent_file<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Tracker urls to announce to, in order of preference.
    pub fn trackers(&self) -> Vec<&str> {
        if self.announce_list.is_empty() {
            self.announce.iter().map(String::as_str).collect()
        } else {
            self.announce_list.iter().map(String::as_str).collect()
        }
    }

    #[inline]
    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    #[inline]
    pub fn total_length(&self) -> u64 {
        self.info.content.length()
    }

    /// Location and hash of every piece.
    pub fn piece_descriptors(&self) -> Vec<PieceDescriptor> {
        PieceDescriptor::generate(
            self.total_length(),
            self.info.piece_length as u32,
            &self.info.pieces,
        )
    }

    /// The files of the torrent with their offsets, relative to the directory
    /// the torrent is saved in.
    pub fn file_layout(&self) -> Vec<FileEntry> {
        let root = PathBuf::from(&self.info.name);
        match &self.info.content {
            InfoContent::Single { length } => vec![FileEntry::new(root, 0, *length)],
            InfoContent::Multi { files } => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|file| {
                        let entry =
                            FileEntry::new(root.join(file.relative_file_path()), offset, file.length);
                        offset += file.length;
                        entry
                    })
                    .collect()
            }
        }
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 8;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), EncodingError> {
        // keys in sorted order
        encoder.emit_dict(|mut e| {
            if let Some(announce) = &self.announce {
                e.emit_pair(b"announce", announce)?;
            }
            if !self.announce_list.is_empty() {
                let tiers: Vec<Vec<&String>> =
                    self.announce_list.iter().map(|url| vec![url]).collect();
                e.emit_pair(b"announce-list", &tiers)?;
            }
            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }
            if let Some(created_by) = &self.created_by {
                e.emit_pair(b"created by", created_by)?;
            }
            if let Some(creation_date) = &self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }
            e.emit_pair(b"info", &self.info)
        })
    }
}

impl FromBencode for MetaInfo {
    const EXPECTED_RECURSION_DEPTH: usize = 8;

    fn decode_bencode_object(object: Object) -> Result<Self, DecodingError>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = Vec::new();
        let mut comment = None;
        let mut created_by = None;
        let mut creation_date = None;
        let mut info = None;
        let mut info_hash = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?
                }
                (b"announce-list", value) => {
                    let mut tiers = value.try_into_list()?;
                    while let Some(tier) = tiers.next_object()? {
                        let mut urls = tier.try_into_list()?;
                        while let Some(url) = urls.next_object()? {
                            announce_list.push(
                                String::decode_bencode_object(url).context("announce-list")?,
                            );
                        }
                    }
                }
                (b"comment", value) | (b"comment.utf-8", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?
                }
                (b"created by", value) | (b"created by.utf-8", value) => {
                    created_by = String::decode_bencode_object(value)
                        .context("created by")
                        .map(Some)?
                }
                (b"creation date", value) => {
                    creation_date = i64::decode_bencode_object(value)
                        .context("creation date")
                        .map(Some)?
                }
                (b"info", value) => {
                    let dict = value.try_into_dictionary()?;
                    let data = dict.into_raw()?;
                    info_hash = Some(ShaHash::from_bytes(data));
                    info = TorrentInfo::from_bencode(data).context("info").map(Some)?
                }
                (unknown_field, _) => {
                    debug!(
                        "skipping unknown field {:?}",
                        String::from_utf8_lossy(unknown_field)
                    );
                }
            }
        }

        Ok(Self {
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            info: info.ok_or_else(|| DecodingError::missing_field("info"))?,
            info_hash: info_hash.ok_or_else(|| DecodingError::missing_field("info"))?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TorrentInfo {
    /// expected hash of every piece
    pub pieces: Vec<ShaHash>,
    /// number of bytes in each piece the content is split into
    pub piece_length: u64,
    /// either single file or directory structure
    pub content: InfoContent,
    /// name of the file or directory
    pub name: String,
}

impl TorrentInfo {
    #[inline]
    pub fn is_file(&self) -> bool {
        self.content.is_file()
    }

    /// Checks the piece hashes cover the content exactly.
    fn validate(&self) -> Result<()> {
        if self.piece_length == 0 || self.piece_length > u64::from(u32::MAX) {
            return Err(Error::Bendecoding {
                reason: format!("invalid piece length {}", self.piece_length),
            });
        }
        let length = self.content.length();
        let expected = (length + self.piece_length - 1) / self.piece_length;
        if expected != self.pieces.len() as u64 {
            return Err(Error::Bendecoding {
                reason: format!(
                    "{} bytes in pieces of {} need {} hashes, got {}",
                    length,
                    self.piece_length,
                    expected,
                    self.pieces.len()
                ),
            });
        }
        Ok(())
    }
}

impl ToBencode for TorrentInfo {
    const MAX_DEPTH: usize = 6;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), EncodingError> {
        encoder.emit_dict(|mut e| {
            match &self.content {
                InfoContent::Single { length } => e.emit_pair(b"length", length),
                InfoContent::Multi { files } => e.emit_pair(b"files", files),
            }?;

            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", &self.piece_length)?;

            let data = self
                .pieces
                .iter()
                .flat_map(|x| x.as_ref().iter())
                .copied()
                .collect::<Vec<_>>();

            e.emit_pair(b"pieces", AsString(&data))
        })
    }
}

impl FromBencode for TorrentInfo {
    const EXPECTED_RECURSION_DEPTH: usize = 6;

    fn decode_bencode_object(object: Object) -> Result<Self, DecodingError>
    where
        Self: Sized,
    {
        let mut name = None;
        let mut pieces = None;
        let mut piece_length = None;
        let mut files = None;
        let mut length = None;

        let mut dict = object.try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"name", value) | (b"name.utf-8", value) => {
                    let value = String::decode_bencode_object(value).context("name")?;
                    if !is_plain_component(&value) {
                        return Err(DecodingError::unexpected_field(format!(
                            "torrent name {:?}",
                            value
                        )));
                    }
                    name = Some(value);
                }
                (b"piece length", value) => {
                    piece_length = u64::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?
                }
                (b"pieces", value) => {
                    let bytes = value.try_into_bytes()?;
                    if bytes.len() % SHA_HASH_LEN != 0 {
                        return Err(DecodingError::unexpected_field("malformed pieces chunks"));
                    }
                    let hashes: std::result::Result<Vec<ShaHash>, _> =
                        bytes.chunks(SHA_HASH_LEN).map(TryInto::try_into).collect();
                    pieces = Some(hashes.map_err(|_| {
                        DecodingError::unexpected_field("malformed pieces chunks")
                    })?);
                }
                (b"files", value) => {
                    if length.is_some() {
                        return Err(DecodingError::unexpected_field("files"));
                    }
                    let mut sub_files = Vec::new();
                    let mut list = value.try_into_list()?;
                    while let Some(file) = list.next_object()? {
                        sub_files.push(SubFileInfo::decode_bencode_object(file)?);
                    }
                    files = Some(sub_files);
                }
                (b"length", value) => {
                    if files.is_some() {
                        return Err(DecodingError::unexpected_field("length"));
                    }
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?
                }
                (unknown_field, _) => {
                    trace!(
                        "skipping unknown info field {:?}",
                        String::from_utf8_lossy(unknown_field)
                    );
                }
            }
        }

        let content = match (length, files) {
            (Some(length), _) => InfoContent::Single { length },
            (None, Some(files)) => InfoContent::Multi { files },
            (None, None) => return Err(DecodingError::missing_field("length or files")),
        };

        Ok(Self {
            name: name.ok_or_else(|| DecodingError::missing_field("name"))?,
            piece_length: piece_length.ok_or_else(|| DecodingError::missing_field("piece length"))?,
            pieces: pieces.ok_or_else(|| DecodingError::missing_field("pieces"))?,
            content,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoContent {
    Single {
        /// length in bytes
        length: u64,
    },
    Multi {
        files: Vec<SubFileInfo>,
    },
}

impl InfoContent {
    #[inline]
    pub fn is_file(&self) -> bool {
        matches!(self, InfoContent::Single { .. })
    }

    /// determines the overall length of the content
    pub fn length(&self) -> u64 {
        match self {
            InfoContent::Single { length } => *length,
            InfoContent::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFileInfo {
    /// The length of the file in bytes
    pub length: u64,
    /// A list of UTF-8 encoded strings corresponding to subdirectory names, the
    /// last of which is the actual file name.
    pub paths: Vec<String>,
}

impl SubFileInfo {
    /// returns the complete Path of the file including its parent directories,
    /// but without the root directory of the torrent
    pub fn relative_file_path(&self) -> PathBuf {
        self.paths.iter().collect()
    }
}

impl ToBencode for SubFileInfo {
    const MAX_DEPTH: usize = 4;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), EncodingError> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", &self.length)?;
            e.emit_pair(b"path", &self.paths)
        })
    }
}

impl FromBencode for SubFileInfo {
    const EXPECTED_RECURSION_DEPTH: usize = 4;

    fn decode_bencode_object(object: Object) -> Result<Self, DecodingError>
    where
        Self: Sized,
    {
        let mut length = None;
        let mut paths = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?
                }
                (b"path", value) | (b"path.utf-8", value) => {
                    let mut path_list = Vec::new();
                    let mut list = value.try_into_list()?;
                    while let Some(path) = list.next_object()? {
                        let path = String::decode_bencode_object(path)?;
                        if !is_plain_component(&path) {
                            return Err(DecodingError::unexpected_field(format!(
                                "path component {:?}",
                                path
                            )));
                        }
                        path_list.push(path);
                    }
                    paths = Some(path_list);
                }
                (unknown_field, _) => {
                    trace!(
                        "skipping unknown file field {:?}",
                        String::from_utf8_lossy(unknown_field)
                    );
                }
            }
        }

        Ok(Self {
            length: length.ok_or_else(|| DecodingError::missing_field("length"))?,
            paths: paths.ok_or_else(|| DecodingError::missing_field("path"))?,
        })
    }
}

/// Whether `component` names a single entry inside the download directory:
/// not empty, not `.` or `..`, no separators, not absolute.
fn is_plain_component(component: &str) -> bool {
    if component.contains('/') || component.contains('\\') {
        return false;
    }
    let mut components = Path::new(component).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
