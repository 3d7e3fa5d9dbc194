//! Catalog records decoded from the monthly dumps

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Kind of dump file, declared in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Labels,
    Artists,
    Masters,
    Releases,
}

impl FileType {
    /// Every file type in the order it must be written
    pub const ALL: [FileType; 4] = [
        FileType::Labels,
        FileType::Artists,
        FileType::Masters,
        FileType::Releases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Labels => "labels",
            FileType::Artists => "artists",
            FileType::Masters => "masters",
            FileType::Releases => "releases",
        }
    }

    /// Document element of the dump file
    pub fn root_element(&self) -> &'static str {
        self.as_str()
    }

    /// Element name of one record inside the document
    pub fn record_element(&self) -> &'static str {
        match self {
            FileType::Labels => "label",
            FileType::Artists => "artist",
            FileType::Masters => "master",
            FileType::Releases => "release",
        }
    }

    /// File types whose rows this type references
    pub fn dependencies(&self) -> &'static [FileType] {
        match self {
            FileType::Labels | FileType::Artists => &[],
            FileType::Masters => &[FileType::Artists],
            FileType::Releases => &[FileType::Labels, FileType::Artists, FileType::Masters],
        }
    }

    /// Deduplicate and sort requested file types into dependency order
    ///
    /// An empty request is a configuration error.
    pub fn ordered(requested: &[FileType]) -> Result<Vec<FileType>, IngestError> {
        if requested.is_empty() {
            return Err(IngestError::InvalidConfig(
                "at least one file type must be requested".to_string(),
            ));
        }
        let mut types = requested.to_vec();
        types.sort();
        types.dedup();
        Ok(types)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "labels" | "label" => Ok(FileType::Labels),
            "artists" | "artist" => Ok(FileType::Artists),
            "masters" | "master" => Ok(FileType::Masters),
            "releases" | "release" => Ok(FileType::Releases),
            other => Err(IngestError::InvalidFileType(other.to_string())),
        }
    }
}

/// Stable external identifier of a record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NaturalKey {
    Id(i64),
    Name(String),
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Id(id) => write!(f, "{}", id),
            NaturalKey::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for NaturalKey {
    fn from(id: i64) -> Self {
        NaturalKey::Id(id)
    }
}

impl From<&str> for NaturalKey {
    fn from(name: &str) -> Self {
        NaturalKey::Name(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Image {
    pub kind: Option<String>,
    pub uri: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Reference to another artist by id and display name
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtistRef {
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelRef {
    pub id: Option<i64>,
    pub name: String,
}

/// Artist credit on a master or release
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtistCredit {
    pub id: Option<i64>,
    pub name: String,
    /// Artist name variation used on this credit
    pub anv: Option<String>,
    pub join: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Video {
    pub src: String,
    pub duration: Option<u32>,
    pub embed: bool,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReleaseLabel {
    pub id: Option<i64>,
    pub name: String,
    pub catno: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Format {
    pub name: String,
    pub qty: Option<String>,
    pub text: Option<String>,
    pub descriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Track {
    pub position: String,
    pub title: String,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Artist {
    pub id: i64,
    pub name: String,
    pub real_name: Option<String>,
    pub profile: Option<String>,
    pub data_quality: Option<String>,
    pub urls: Vec<String>,
    pub name_variations: Vec<String>,
    pub aliases: Vec<ArtistRef>,
    pub members: Vec<ArtistRef>,
    pub groups: Vec<ArtistRef>,
    pub images: Vec<Image>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub contact_info: Option<String>,
    pub profile: Option<String>,
    pub data_quality: Option<String>,
    pub urls: Vec<String>,
    pub parent_label: Option<LabelRef>,
    pub sublabels: Vec<LabelRef>,
    pub images: Vec<Image>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Master {
    pub id: i64,
    pub title: String,
    pub main_release: Option<i64>,
    pub year: Option<i32>,
    pub data_quality: Option<String>,
    pub notes: Option<String>,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
    pub artists: Vec<ArtistCredit>,
    pub images: Vec<Image>,
    pub videos: Vec<Video>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub status: Option<String>,
    pub title: String,
    pub country: Option<String>,
    pub released: Option<String>,
    pub notes: Option<String>,
    pub data_quality: Option<String>,
    pub master_id: Option<i64>,
    pub is_main_release: bool,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
    pub artists: Vec<ArtistCredit>,
    pub extra_artists: Vec<ArtistCredit>,
    pub labels: Vec<ReleaseLabel>,
    pub formats: Vec<Format>,
    pub tracklist: Vec<Track>,
    pub images: Vec<Image>,
    pub videos: Vec<Video>,
    pub content_hash: Option<String>,
}

/// One record decoded from a dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CatalogRecord {
    Artist(Artist),
    Label(Label),
    Master(Master),
    Release(Release),
}

impl CatalogRecord {
    pub fn file_type(&self) -> FileType {
        match self {
            CatalogRecord::Artist(_) => FileType::Artists,
            CatalogRecord::Label(_) => FileType::Labels,
            CatalogRecord::Master(_) => FileType::Masters,
            CatalogRecord::Release(_) => FileType::Releases,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            CatalogRecord::Artist(a) => a.id,
            CatalogRecord::Label(l) => l.id,
            CatalogRecord::Master(m) => m.id,
            CatalogRecord::Release(r) => r.id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_ordering_follows_dependencies() {
        let ordered =
            FileType::ordered(&[FileType::Releases, FileType::Artists, FileType::Releases])
                .unwrap();
        assert_eq!(ordered, vec![FileType::Artists, FileType::Releases]);

        for ft in FileType::ALL {
            for dep in ft.dependencies() {
                assert!(dep < &ft, "{} must precede {}", dep, ft);
            }
        }
    }

    #[test]
    fn test_empty_file_type_request_rejected() {
        assert!(matches!(FileType::ordered(&[]), Err(IngestError::InvalidConfig(_))));
    }

    #[test]
    fn test_file_type_from_str() {
        assert_eq!("Artists".parse::<FileType>().unwrap(), FileType::Artists);
        assert_eq!("release".parse::<FileType>().unwrap(), FileType::Releases);
        assert!(matches!("genres".parse::<FileType>(), Err(IngestError::InvalidFileType(_))));
    }

    #[test]
    fn test_natural_key_display() {
        assert_eq!(NaturalKey::from(42).to_string(), "42");
        assert_eq!(NaturalKey::from("Techno").to_string(), "Techno");
    }
}
