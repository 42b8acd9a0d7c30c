//! Bencoded torrent metainfo (".torrent" file) parsing.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    /// Hashes the bencoded `info` dictionary, which uniquely identifies the
    /// torrent.
    pub fn create_info_hash(&self) -> Result<Sha1Hash, serde_bencode::Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`, as recorded
    /// in the torrent's `pieces` field.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index * 20;
        let bytes = self.info.pieces.get(start..start + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(bytes);
        Some(hash)
    }

    /// Builds the file system layout described by this metainfo.
    pub fn structure(&self) -> FsStructure {
        match &self.info.files {
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|file| {
                        let len = file.length as u64;
                        let info = FileInfo {
                            path: file.path.iter().collect(),
                            len,
                            torrent_offset,
                        };
                        torrent_offset += len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or(0),
                torrent_offset: 0,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
